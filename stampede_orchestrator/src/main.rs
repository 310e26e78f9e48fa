use clap::Parser;
use stampede_core::suite::SuiteRegistry;
use stampede_core::LoggerManager;
use stampede_env::StampedeConfig;
use stampede_orchestrator::{plan, run_load};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Load orchestrator: discovers agents, drives one run described by a TOML
/// plan and prints the merged summary.
#[derive(Parser)]
#[command(name = "stampede_orchestrator")]
struct Args {
    /// Path to the TOML run plan.
    plan: PathBuf,
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
        "orchestrator.log",
    );
    info!("Logger initialized");

    // 4. 플랜 로드
    let plan = plan::load(&args.plan)?;
    let verbosity = plan.options.verbosity;
    let dump = plan.options.dump_log.clone();

    // 5. 빌트인 suite 레지스트리로 실행
    let registry = Arc::new(SuiteRegistry::builtin());
    let summary = run_load(plan.test, plan.options, registry, &settings).await?;

    if dump.dump_all() {
        for line in summary.log.render(3) {
            println!("{}", line);
        }
    } else if dump.dump_failures_only() {
        for entry in summary.log.failures() {
            println!("{}", entry);
        }
    } else {
        for line in summary.log.render(verbosity) {
            println!("{}", line);
        }
    }
    println!("{}", summary.line());

    if summary.failed > 0 || summary.aborted > 0 {
        std::process::exit(1);
    }
    Ok(())
}
