use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    Server,

    /// Print how much of today's quota a user has spent.
    Usage { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    let conf = sufuria::conf::load()?;
    sufuria::logging::init(conf.log_level)?;
    tracing::debug!(?cli, "Starting.");
    match &cli.cmd {
        Cmd::Server => sufuria::server::run(conf).await,
        Cmd::Usage { username } => {
            let storage = sufuria::data::Storage::connect(
                &conf.database_url,
                conf.busy_timeout()?,
            )
            .await?;
            let username = sufuria::auth::normalize_username(username);
            let user = storage
                .user_by_username(&username)
                .await?
                .ok_or_else(|| anyhow!("No such user: {username:?}"))?;
            let used = storage
                .usage_count(user.id, sufuria::data::today())
                .await?;
            println!("{} {used}/{}", user.username, conf.quota.daily_limit);
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
