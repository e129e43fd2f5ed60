use clap::{Parser, Subcommand};
use wabridge::responder::{FallbackReplies, GatewayRequest, GatewayResult, ProcessResponder, Responder};

#[derive(Parser)]
#[command(name = "wabridge")]
#[command(about = "WhatsApp bridge CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge: HTTP gateway, transport and message dispatch.
    Run {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 5001)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Invoke the responder once and print the reply that would be sent.
    Ask {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Message text
        text: String,

        /// Sender id passed to the responder
        #[arg(default_value = "cli")]
        sender: String,
    },

    /// Print the last published lifecycle status.
    Status {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Send a proactive message through a running gateway.
    Send {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Recipient phone number or id
        to: String,

        /// Message text
        message: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("wabridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config).map_err(|e| ("init", e)),
        Some(Commands::Run { config, port }) => run_bridge(config, port).await.map_err(|e| ("run", e)),
        Some(Commands::Ask { config, text, sender }) => {
            run_ask(config, text, sender).await.map_err(|e| ("ask", e))
        }
        Some(Commands::Status { config }) => run_status(config).await.map_err(|e| ("status", e)),
        Some(Commands::Send { config, to, message }) => {
            run_send(config, to, message).await.map_err(|e| ("send", e))
        }
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err((command, e)) = result {
        log::error!("{} failed: {:#}", command, e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(wabridge::config::default_config_path);
    let dir = wabridge::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = wabridge::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting bridge on {}:{} (transport: {:?})",
        config.gateway.bind,
        config.gateway.port,
        config.transport.kind
    );
    wabridge::gateway::run_gateway(config, path).await
}

async fn run_ask(
    config_path: Option<std::path::PathBuf>,
    text: String,
    sender: String,
) -> anyhow::Result<()> {
    let (config, path) = wabridge::config::load_config(config_path)?;
    let responder = ProcessResponder::from_config(
        &config.responder,
        wabridge::config::resolve_responder_dir(&config, &path),
    );
    let fallbacks = FallbackReplies::from(config.replies.clone());
    let result = responder
        .invoke(&GatewayRequest::new(text, sender), config.responder.timeout())
        .await;
    if let GatewayResult::Failure(ref f) = result {
        eprintln!("responder failed: {}", f);
    }
    match result.effective_reply(&fallbacks) {
        Some(reply) => println!("{}", reply),
        None => println!("(no reply)"),
    }
    match result {
        GatewayResult::Reply(_) => Ok(()),
        GatewayResult::Failure(f) => Err(anyhow::anyhow!(f)),
    }
}

async fn run_status(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = wabridge::config::load_config(config_path)?;
    let paths = wabridge::config::resolve_state_paths(&config, &path);
    let status = wabridge::status::read_status(&paths.status).await?;
    match status {
        Some(status) => println!("{}", status),
        None => println!("unknown (no status published at {})", paths.status.display()),
    }
    if wabridge::status::read_pending_pairing(status, &paths.pairing)
        .await
        .is_some()
    {
        println!("pairing code waiting in {}", paths.pairing.display());
    }
    Ok(())
}

async fn run_send(
    config_path: Option<std::path::PathBuf>,
    to: String,
    message: String,
) -> anyhow::Result<()> {
    let (config, _) = wabridge::config::load_config(config_path)?;
    let url = format!("{}/send", wabridge::config::gateway_base_url(&config));
    let mut req = reqwest::Client::new()
        .post(&url)
        .json(&wabridge::gateway::SendParams { to, message });
    if let Some(token) = wabridge::config::resolve_gateway_token(&config) {
        req = req.bearer_auth(token);
    }
    let res = req.send().await?;
    let status = res.status();
    if !status.is_success() {
        anyhow::bail!("gateway returned {}", status);
    }
    let result: wabridge::gateway::SendResult = res.json().await?;
    if !result.ok {
        anyhow::bail!("transport rejected the message");
    }
    println!("sent");
    Ok(())
}
