//! `realtime_hub` 可执行入口：加载配置、启动 WebSocket 服务、心跳监视器、后台维护任务与管理接口。

use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use realtime_hub::api;
use realtime_hub::config::AppConfig;
use realtime_hub::state::HubState;
use realtime_hub::ws_server::service::WsService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// nonce 缓存与空闲令牌桶的清理周期
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .parse_default_env()
        .try_init()
    {
        eprintln!("初始化 env_logger 失败: {}", e);
    }
    info!("[主程序] 日志系统已初始化。");

    let config = AppConfig::load().context("加载应用配置失败")?;
    let state = HubState::new(config).context("创建服务状态失败")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(state.heartbeat_monitor().run(shutdown_rx.clone()));
    tokio::spawn(run_maintenance(Arc::clone(&state), shutdown_rx.clone()));

    if state.config.api.enabled {
        let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("绑定管理接口地址 {} 失败", addr))?;
        info!("[主程序] 管理接口正在监听 http://{}", addr);
        let router = api::create_router(Arc::clone(&state));
        let mut api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                error!("[主程序] 管理接口运行出错: {}", e);
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("[主程序] 收到 Ctrl-C，开始关停..."),
            Err(e) => error!("[主程序] 无法监听 Ctrl-C 信号: {}，立即关停", e),
        }
        shutdown_tx.send_replace(true);
    });

    WsService::new(Arc::clone(&state)).start(shutdown_rx).await?;
    info!("[主程序] 服务已关停。");
    Ok(())
}

async fn run_maintenance(state: Arc<HubState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (nonces, buckets) = state.run_maintenance();
                if nonces > 0 || buckets > 0 {
                    info!("[后台维护] 已清理 {} 个过期 nonce、{} 个空闲令牌桶", nonces, buckets);
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}
