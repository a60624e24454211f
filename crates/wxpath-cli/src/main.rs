use std::io::{self, Write};

use clap::Parser;
use futures::StreamExt;
use tokio::runtime;
use wxpath::hooks;
use wxpath::{ClientConfig, Engine, EngineConfig};

/// Run a wxpath expression and print one JSON line per extracted value.
#[derive(Debug, Parser)]
#[command(name = "wxpath", version)]
pub struct Args {
    /// The wxpath expression
    pub expression: String,

    /// Maximum crawl depth
    #[arg(long, default_value_t = 1)]
    pub depth: i64,

    /// Maximum concurrent fetches
    #[arg(long, default_value_t = 16)]
    pub concurrency: usize,

    /// Maximum concurrent fetches per host
    #[arg(long, default_value_t = 8)]
    pub concurrency_per_host: usize,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Print the parsed expression before running
    #[arg(long)]
    pub verbose: bool,
}

impl From<&Args> for EngineConfig {
    fn from(args: &Args) -> Self {
        EngineConfig {
            client: ClientConfig {
                concurrency: args.concurrency,
                per_host: args.concurrency_per_host,
                ..ClientConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    if args.verbose {
        eprintln!("wxpath expression: {}", args.expression);
        eprintln!("parsed expression: {:?}", wxpath::parse(&args.expression)?);
    }

    hooks::register(hooks::Serializer);

    let config = EngineConfig::from(&args);
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async move {
        let engine = Engine::new(config);
        let mut stream = engine.run(&args.expression, args.depth)?;

        let stdout = io::stdout();
        let mut out = stdout.lock();
        while let Some(item) = stream.next().await {
            let value = item?;
            let line = serde_json::to_string(&value.to_json())?;
            match writeln!(out, "{line}").and_then(|_| out.flush()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    })
}
