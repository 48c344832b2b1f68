//! socbot - 安全运营对话式 Agent
//!
//! 入口：初始化日志与配置，显式构造会话库、恢复管理器、StateManager 与 Dispatcher，
//! 然后从 stdin 逐行读取请求，每个请求一个工作线程。Ctrl-C / SIGTERM 或 EOF 时，
//! 等已接收的请求写完会话后再关闭组件。
//!
//! 输入行格式：`user<TAB>room<TAB>message`，或直接一行消息（使用 --user / --room）。

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use socbot::config::load_config;
use socbot::core::{
    ConfigComponentProvider, RecoveryManager, RequestTracker, StateManager, DEFAULT_SYSTEM_PROMPT,
};
use socbot::dispatcher::{Dispatcher, DispatcherSettings, StateHealthTests};
use socbot::memory::{SessionLimits, SessionStore, SqliteSessionStore};
use socbot::observability;

/// 收到信号后等待进行中请求的上限
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "socbot")]
#[command(author, version, about = "Conversational assistant for security operations analysts")]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// 裸消息行使用的用户 ID
    #[arg(long, default_value = "cli")]
    user: String,

    /// 裸消息行使用的房间 ID
    #[arg(long, default_value = "local")]
    room: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init();

    let config = load_config(args.config.clone()).context("Failed to load configuration")?;

    let sessions: Arc<dyn SessionStore> = Arc::new(
        SqliteSessionStore::open(&config.session.db_path, SessionLimits::from(&config.session))
            .with_context(|| format!("Failed to open session store {}", config.session.db_path.display()))?,
    );
    let recovery = Arc::new(RecoveryManager::from_section(&config.recovery));
    let system_prompt = config
        .app
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let state = Arc::new(StateManager::new(
        ConfigComponentProvider::new(config.clone()),
        recovery.clone(),
        system_prompt,
    ));

    if !state.initialize_all_components() {
        tracing::error!("mandatory components failed to initialize; only fast-path commands will work");
    }

    let dispatcher = Arc::new(
        Dispatcher::new(
            state.clone(),
            sessions.clone(),
            recovery,
            DispatcherSettings::from_config(&config),
        )
        .with_health_tests(Arc::new(StateHealthTests::new(state.clone(), sessions))),
    );

    let tracker = RequestTracker::new();
    spawn_signal_watcher(state.clone(), tracker.clone()).context("Failed to install signal handler")?;
    tracing::info!(app = %config.app.name, "ready, reading requests from stdin");

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let Some(guard) = tracker.begin() else {
            tracing::warn!("shutting down, no longer accepting requests");
            break;
        };
        let (user, room, message) = parse_request_line(&line, &args.user, &args.room);
        let dispatcher = dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ask-{user}-{room}"))
            .spawn(move || {
                let _guard = guard;
                let response = dispatcher.ask(Some(&message), &user, &room);
                println!("[{user}_{room}] {response}");
            })
            .context("Failed to spawn request thread")?;
        workers.push(handle);
        workers.retain(|h| !h.is_finished());
    }

    for handle in workers {
        if handle.join().is_err() {
            tracing::error!("request thread panicked");
        }
    }
    state.shutdown();
    Ok(())
}

/// `user\troom\tmessage` 或裸消息
fn parse_request_line(line: &str, default_user: &str, default_room: &str) -> (String, String, String) {
    let mut parts = line.splitn(3, '\t');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(room), Some(message)) if !user.trim().is_empty() && !room.trim().is_empty() => (
            user.trim().to_string(),
            room.trim().to_string(),
            message.to_string(),
        ),
        _ => (default_user.to_string(), default_room.to_string(), line.to_string()),
    }
}

/// Ctrl-C / SIGTERM：拒绝新请求，等已接收的请求写完会话，再关闭组件并退出
fn spawn_signal_watcher(state: Arc<StateManager>, tracker: Arc<RequestTracker>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    std::thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            let code = runtime.block_on(wait_for_signal());
            if !tracker.drain(SHUTDOWN_DRAIN_TIMEOUT) {
                tracing::warn!(in_flight = tracker.in_flight(), "exiting with requests still running");
            }
            state.shutdown();
            std::process::exit(code);
        })?;
    Ok(())
}

/// 返回对应信号的退出码
async fn wait_for_signal() -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                Ok(()) = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, draining in-flight requests");
                    return 130;
                }
                Some(()) = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, draining in-flight requests");
                    return 143;
                }
                else => {}
            }
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, draining in-flight requests");
    130
}
