use actix::Actor;
use clap::Parser;
use stampede_agent::Agent;
use stampede_core::link;
use stampede_core::suite::SuiteRegistry;
use stampede_core::LoggerManager;
use stampede_env::StampedeConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Load agent: connects to the orchestrator and runs its share of the
/// virtual-user population.
#[derive(Parser)]
#[command(name = "stampede_agent")]
struct Args {
    /// Orchestrator host to connect to.
    #[arg(long)]
    master: Option<String>,
    /// Orchestrator -> agent command port.
    #[arg(long)]
    dport: Option<u16>,
    /// Agent -> orchestrator report port.
    #[arg(long)]
    uport: Option<u16>,
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    // 1. 환경변수 로드
    dotenv::dotenv().ok();
    let args = Args::parse();

    // 2. 설정 파일 로드 + CLI 오버라이드
    let mut settings = StampedeConfig::global().clone();
    if let Some(master) = args.master {
        settings.net.master_host = master;
    }
    if let Some(dport) = args.dport {
        settings.net.down_port = dport;
    }
    if let Some(uport) = args.uport {
        settings.net.up_port = uport;
    }

    // 3. 로거 초기화
    let _logger = LoggerManager::setup(
        &settings.logging.level,
        &settings.logging.directory,
        "agent.log",
    );
    info!("Logger initialized");

    // 4. 빌트인 suite 레지스트리 준비
    let registry = Arc::new(SuiteRegistry::builtin());

    // Reconnect after each run so the orchestrator can come and go.
    loop {
        let (up, inbound) = match link::connect(
            &settings.net.master_host,
            settings.net.down_port,
            settings.net.up_port,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    "orchestrator not reachable at {} ({}); retrying",
                    settings.net.master_host, e
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("connected to orchestrator at {}", settings.net.master_host);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let _addr = Agent::new(registry.clone(), settings.timing.clone(), up, inbound)
            .on_disconnect(done_tx)
            .start();

        tokio::select! {
            _ = done_rx => info!("down link closed; reconnecting"),
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
