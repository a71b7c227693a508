use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use xray_probe::config::{CheckMethod, Config};
use xray_probe::proxy::load_proxy_list;
use xray_probe::report::Report;
use xray_probe::ui::ProgressTracker;
use xray_probe::{CheckObserver, Session};

/// 基于 xray 的代理检测工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short = 'f', long, default_value = "config/config.yaml")]
    config: String,

    /// 代理列表文件（JSON 或 base64 编码的 JSON）
    #[arg(short = 'i', long, default_value = "proxies.json")]
    input: String,

    /// 检测方式：ip, status, download
    #[arg(long)]
    method: Option<CheckMethod>,

    /// 超时时间（毫秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 并发数
    #[arg(long)]
    concurrent: Option<usize>,

    /// 本地起始端口
    #[arg(long)]
    start_port: Option<u16>,

    /// xray 可执行文件路径
    #[arg(long)]
    xray: Option<String>,

    /// 只检测前 N 个节点
    #[arg(long)]
    limit: Option<usize>,

    /// 检测间隔（秒），0 表示只检测一次
    #[arg(long)]
    interval: Option<u64>,

    /// 是否显示进度条
    #[arg(long)]
    progress: Option<bool>,

    /// 把报告保存为 JSON 文件
    #[arg(long)]
    json: Option<String>,

    /// 导出可用节点列表到输出目录
    #[arg(long)]
    export: bool,

    /// 输出目录
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: &str) -> Config {
    if !Path::new(path).exists() {
        println!("📝 使用默认配置 (配置文件不存在: {})", path);
        return Config::default();
    }

    println!("📁 从配置文件加载设置: {}", path);
    match Config::load_from_file(path) {
        Ok(config) => {
            println!("✅ 配置文件加载成功");
            config
        }
        Err(e) => {
            println!("⚠️  配置文件加载失败: {}", e);
            println!("📝 使用默认配置");
            Config::default()
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(method) = args.method {
        config.check_method = method;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
        config.download_timeout = timeout;
    }
    if let Some(concurrent) = args.concurrent {
        config.concurrent = concurrent;
    }
    if let Some(start_port) = args.start_port {
        config.start_port = start_port;
    }
    if let Some(xray) = &args.xray {
        config.xray_binary = xray.clone();
    }
    if let Some(interval) = args.interval {
        config.check_interval = interval;
    }
    if let Some(progress) = args.progress {
        config.print_progress = progress;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag { "✅ 启用" } else { "❌ 禁用" }
}

fn print_config(config: &Config, args: &Args) {
    println!("\n⚙️  当前配置:");
    println!("  配置文件: {}", args.config);
    println!("  代理列表: {}", args.input);
    println!("  xray: {}", config.xray_binary);
    println!("  起始端口: {}", config.start_port);
    println!("  检测方式: {}", config.check_method);
    println!("  并发数: {}", config.concurrent);
    println!("  超时时间: {}ms", config.check_timeout().as_millis());
    match config.get_check_interval() {
        Some(interval) => println!("  检测间隔: {}s", interval.as_secs()),
        None => println!("  检测间隔: 只检测一次"),
    }
    println!("  进度显示: {}", enabled(config.print_progress));
    println!("  输出目录: {}", config.output_dir);
}

fn output_report(report: &Report, config: &Config, args: &Args) -> Result<()> {
    report.print_results();
    report.print_summary();

    if let Some(path) = &args.json {
        report
            .save_json(path)
            .with_context(|| format!("failed to write report to {path}"))?;
        println!("\n💾 JSON 报告已保存: {}", path);
    }

    if args.export {
        let path = report
            .export_to_dir(&config.output_dir)
            .with_context(|| format!("failed to export results to {}", config.output_dir))?;
        println!("💾 可用节点已导出: {}", path.display());
    }

    Ok(())
}

async fn run(session: &Session, args: &Args) -> Result<()> {
    let interval = session.config().get_check_interval();

    loop {
        println!("\n🔍 开始检测代理节点...");
        println!("{:=<80}", "");

        let report = tokio::select! {
            report = session.run_pass() => report.context("check pass failed")?,
            _ = tokio::signal::ctrl_c() => {
                println!("\n⚠️  收到中断信号，停止检测");
                return Ok(());
            }
        };
        output_report(&report, session.config(), args)?;

        let Some(interval) = interval else {
            return Ok(());
        };
        println!("\n⏰ {} 秒后开始下一轮检测 (Ctrl-C 退出)", interval.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\n👋 收到中断信号，退出");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    println!("🚀 xray 代理检测工具 v{}", env!("CARGO_PKG_VERSION"));
    println!("{:=<80}", "");

    let mut config = load_config(&args.config);
    apply_overrides(&mut config, &args);

    // 设置日志级别
    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    config.validate().context("invalid configuration")?;
    print_config(&config, &args);

    // 加载代理列表
    println!("\n📡 加载代理节点...");
    let raws = load_proxy_list(&args.input, args.limit)
        .with_context(|| format!("failed to load proxy list {}", args.input))?;
    println!("✅ 获取到 {} 个代理节点", raws.len());

    let tracker = Arc::new(ProgressTracker::new(config.print_progress));
    let observer = tracker
        .is_enabled()
        .then(|| tracker.clone() as Arc<dyn CheckObserver>);

    let session = Session::start(config, raws, observer)
        .await
        .context("failed to start forwarder")?;
    info!("forwarder running, {} local ports ready", session.registry().len());

    let outcome = run(&session, &args).await;

    // 无论检测是否成功都要停止 xray
    if let Err(e) = session.shutdown().await {
        warn!("failed to stop forwarder: {e}");
    }

    outcome?;
    println!("\n🎉 检测完成!");
    Ok(())
}
