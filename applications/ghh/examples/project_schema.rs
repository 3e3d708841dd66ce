/// Expects to be called like this:
/// env \
///   GHH_TOKEN=github_pat_*** \
///   RUST_LOG=trace \
///   cargo run --example project_schema acme 3
use ghh::{
    github::{GithubClient, OwnerKind},
    logger::Logger,
    settings,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logger = Logger::Verbose;
    logger.init();

    let mut args = std::env::args().skip(1);
    let (Some(organization), Some(number)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: project_schema <organization> <project-number>");
    };

    let client = GithubClient::new(settings::get_token()?, CancellationToken::new())?;
    let project = client
        .query_project(&organization, OwnerKind::Organization, number.parse()?)
        .await?;

    logger.print_json("project", &project);

    Ok(())
}
