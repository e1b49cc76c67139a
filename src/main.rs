//! dax_tagview - 标签树查看工具
//!
//! 在内存服务端上按配置预置类型和标签，然后：
//! 1. dump: 打印一次完整标签树
//! 2. types: 打印可用类型
//! 3. set: 修改一个叶子值后打印标签树
//! 4. monitor: 启动事件管道，周期刷新并打印增删和监视值变化

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use dax_tagview::{
    write_text, EventSubscriptionManager, LiveTagSet, MemoryServer, Notification,
    TagServerClient, TypeId, ViewerConfig, WatchList,
};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// 演示变动用的临时标签
const SCRATCH_TAG: &str = "Scratch";

#[derive(Parser)]
#[command(name = "dax_tagview")]
#[command(about = "Live tag tree viewer over an in-memory tag server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 配置文件路径（JSON），缺省使用内置示例
    #[arg(short, long)]
    config: Option<String>,

    /// 事件等待超时（毫秒），覆盖配置
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// 把生效的配置写到该路径（JSON）
    #[arg(long)]
    save_config: Option<String>,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 打印一次完整标签树
    Dump,

    /// 打印可用类型
    Types,

    /// 修改一个值: set Motor1.Speed 12.5
    Set { path: String, value: String },

    /// 实时监控
    Monitor {
        /// 运行秒数，0 表示直到 Ctrl+C
        #[arg(short, long, default_value_t = 0)]
        seconds: u64,

        /// 关闭演示用的标签增删
        #[arg(long)]
        no_churn: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => {
            info!("tagview: Loading config from {}", path);
            ViewerConfig::from_file(path)?
        }
        None => ViewerConfig::default(),
    };
    if let Some(t) = cli.timeout_ms {
        config.event_timeout_ms = t.max(1);
    }
    if let Some(path) = &cli.save_config {
        config.to_file(path)?;
        info!("tagview: Saved config to {}", path);
    }

    let server = Arc::new(MemoryServer::connected());
    config.seed(server.as_ref())?;
    let client: Arc<dyn TagServerClient> = server.clone();

    match cli.command {
        None | Some(Commands::Dump) => {
            let mut live = LiveTagSet::new(client, config.writable);
            live.populate()?;
            live.refresh()?;
            print!("{}", live.tree().render());
        }
        Some(Commands::Types) => {
            let live = LiveTagSet::new(client, config.writable);
            for (name, id) in live.catalog().builtin_types() {
                println!("{:<12} 0x{:08X}", name, id.0);
            }
        }
        Some(Commands::Set { path, value }) => {
            let mut live = LiveTagSet::new(client, config.writable);
            live.populate()?;
            let node = live
                .tree()
                .find_by_name(&path)
                .ok_or_else(|| anyhow::anyhow!("no node named {}", path))?;
            live.write_value(node, &value)?;
            print!("{}", live.tree().render());
        }
        Some(Commands::Monitor { seconds, no_churn }) => {
            run_monitor(server, client, &config, seconds, !no_churn).await?;
        }
    }

    Ok(())
}

async fn run_monitor(
    server: Arc<MemoryServer>,
    client: Arc<dyn TagServerClient>,
    config: &ViewerConfig,
    seconds: u64,
    churn: bool,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("tagview: Received Ctrl+C, stopping...");
            running_clone.store(false, Ordering::SeqCst);
        }
    });

    let mut live = LiveTagSet::new(client.clone(), config.writable);
    live.populate()?;
    live.refresh()?;
    print!("{}", live.tree().render());

    let mut events = EventSubscriptionManager::new(client.clone(), config.event_timeout_ms);
    let rx = events.start()?;

    let mut watch = WatchList::new(client.clone());
    for path in &config.watch {
        match watch.add(&events, path) {
            Ok(e) => println!("watch {} = {}", e.path, e.value.as_deref().unwrap_or("")),
            Err(e) => warn!("tagview: cannot watch {}: {}", path, e),
        }
    }

    let churn_handle = churn.then(|| {
        let churn_running = running.clone();
        tokio::spawn(async move { run_churn(server, churn_running).await })
    });

    info!("tagview: Press Ctrl+C to stop");
    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    let mut refresh =
        tokio::time::interval(Duration::from_millis(config.refresh_interval_ms.max(1)));

    while running.load(Ordering::SeqCst) {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }
        tokio::select! {
            _ = poll.tick() => {
                while let Ok(n) = rx.try_recv() {
                    handle_notification(&mut live, &mut watch, &events, &n);
                    if let Notification::Closed(_) = n {
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }
            _ = refresh.tick() => {
                let ok = live.refresh()?;
                debug!("tagview: refreshed {} tags", ok);
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    if let Some(h) = churn_handle {
        let _ = h.await;
    }
    watch.clear(&events);
    events.stop();

    live.refresh()?;
    print!("{}", live.tree().render());
    info!("tagview: Done.");
    Ok(())
}

fn handle_notification(
    live: &mut LiveTagSet,
    watch: &mut WatchList,
    events: &EventSubscriptionManager,
    n: &Notification,
) {
    match n {
        Notification::TagAdded(index) => {
            if live.apply(n) {
                let name = live
                    .tree()
                    .find_root(*index)
                    .and_then(|r| live.tree().get(r))
                    .map(|node| node.name.clone())
                    .unwrap_or_default();
                println!("+ [{}] {}", index, name);
            }
        }
        Notification::TagDeleted(index) => {
            watch.forget_tag(events, *index);
            if live.apply(n) {
                println!("- [{}]", index);
            }
        }
        Notification::ValueChanged { .. } => {
            if let Some(e) = watch.apply(n) {
                println!("{} = {}", e.path, e.value.as_deref().unwrap_or(""));
            }
        }
        Notification::Closed(_) => {
            live.apply(n);
        }
    }
}

/// 演示变动：计数器递增，临时标签交替增删
async fn run_churn(server: Arc<MemoryServer>, running: Arc<AtomicBool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut counter = 0u32;
    while running.load(Ordering::SeqCst) {
        tick.tick().await;
        counter = counter.wrapping_add(1);
        if let Err(e) = write_text(server.as_ref(), "Counter", &counter.to_string()) {
            debug!("tagview: counter update skipped: {}", e);
        }
        let result = match server.tag_by_name(SCRATCH_TAG) {
            Ok(tag) => server.delete_tag(tag.index),
            Err(_) => server.add_tag(SCRATCH_TAG, TypeId::INT, 3, 0).map(|_| ()),
        };
        if let Err(e) = result {
            warn!("tagview: churn failed: {}", e);
        }
    }
}
