#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use packet_parser::PacketBuf;
use palisade_config::ConfigManager;
use palisade_core::{Firewall, HookPoint, LogEntry, MAX_RULES, Timestamp};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utils::{CONFIG_READONLY_ENV, config_root, hex_to_bytes, resolve_under};

mod rules_file;
mod runtime_config;
mod state;
mod trace;

use rules_file::{load_rules, write_rules};
use runtime_config::{LogConfig, LogFormat, RuntimeConfig, load_runtime_config};
use state::{StateLock, StateStore};

#[derive(Parser, Debug)]
#[command(name = "palisade", version, about = "Stateful IPv4 firewall with transparent proxy redirection")]
struct Cli {
    /// Directory holding rules, runtime config and firewall state.
    #[arg(long, value_name = "DIR", env = "PALISADE_CONFIG_ROOT")]
    config_root: Option<PathBuf>,

    /// Override the configured log level (e.g. "debug", "palisade_core=trace").
    #[arg(long, value_name = "LEVEL", env = "PALISADE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start filtering.
    Activate,
    /// Stop filtering; every packet is accepted unlogged.
    Deactivate,
    Status,
    ShowRules,
    /// Validate and install a rules file from under the config root.
    LoadRules { file: String },
    ClearRules,
    /// Reinstall the previously recorded rule set.
    RollbackRules,
    ShowLog,
    ClearLog,
    ShowConnections {
        /// Print the export line format.
        #[arg(long)]
        raw: bool,
    },
    ClearConnections,
    /// Record the port the proxy uses toward the real server.
    RegisterProxyClient {
        #[arg(long)]
        client: SocketAddrV4,
        #[arg(long)]
        server: SocketAddrV4,
        #[arg(long)]
        port: u16,
    },
    /// Print the original server of a proxied client.
    ProxyTarget {
        #[arg(long)]
        client: SocketAddrV4,
    },
    /// Decide a single hex-encoded IPv4 packet.
    Eval {
        #[arg(long, value_parser = trace::parse_hook)]
        hook: HookPoint,
        #[arg(long = "in", value_name = "IFACE")]
        in_iface: Option<String>,
        #[arg(long = "out", value_name = "IFACE")]
        out_iface: Option<String>,
        /// Unix seconds to evaluate at; defaults to now.
        #[arg(long)]
        at: Option<Timestamp>,
        packet: String,
    },
    /// Feed a packet trace through the firewall.
    Replay {
        trace: PathBuf,
        /// Only print the summary.
        #[arg(long)]
        quiet: bool,
    },
}

struct App {
    config: ConfigManager,
    runtime: RuntimeConfig,
    firewall: Firewall,
}

impl App {
    fn open(root: PathBuf) -> Result<Self> {
        let config = ConfigManager::new(root)?;
        let runtime = load_runtime_config(&config.paths.runtime)?;
        let firewall = Firewall::new(runtime.firewall.clone());
        Ok(App {
            config,
            runtime,
            firewall,
        })
    }

    /// Serializes this invocation against others on the same root. Hold the
    /// returned guard across load, the command and its save.
    fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.config.paths)
    }

    fn load(&self) -> Result<()> {
        let installed = self.firewall.replace_rules(load_rules(&self.config.paths.rules)?);
        StateStore::new(&self.config.paths).load(&self.firewall)?;
        info!(rules = installed, active = self.firewall.is_active(), "firewall loaded");
        Ok(())
    }

    fn save(&self, now: Timestamp) -> Result<()> {
        StateStore::new(&self.config.paths).save(&self.firewall, now)
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.config_root.unwrap_or_else(config_root);
    let app = App::open(root)?;
    init_logging(&app.runtime.log, cli.log_level.as_deref());
    let _lock = app.lock()?;
    app.load()?;
    let now = unix_now();

    match cli.command {
        Command::Activate => cmd_set_active(&app, true, now),
        Command::Deactivate => cmd_set_active(&app, false, now),
        Command::Status => cmd_status(&app, now),
        Command::ShowRules => cmd_show_rules(&app),
        Command::LoadRules { file } => cmd_load_rules(&app, &file, now),
        Command::ClearRules => cmd_clear_rules(&app, now),
        Command::RollbackRules => cmd_rollback_rules(&app, now),
        Command::ShowLog => cmd_show_log(&app),
        Command::ClearLog => cmd_clear_log(&app, now),
        Command::ShowConnections { raw } => cmd_show_connections(&app, raw, now),
        Command::ClearConnections => cmd_clear_connections(&app, now),
        Command::RegisterProxyClient {
            client,
            server,
            port,
        } => cmd_register_proxy_client(&app, client, server, port, now),
        Command::ProxyTarget { client } => cmd_proxy_target(&app, client, now),
        Command::Eval {
            hook,
            in_iface,
            out_iface,
            at,
            packet,
        } => cmd_eval(
            &app,
            hook,
            in_iface.as_deref(),
            out_iface.as_deref(),
            at.unwrap_or(now),
            &packet,
        ),
        Command::Replay { trace, quiet } => cmd_replay(&app, &trace, quiet, now),
    }
}

fn init_logging(config: &LogConfig, override_level: Option<&str>) {
    let filter = match override_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // Fails only when a global subscriber is already installed.
    let _ = match config.format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
}

fn unix_now() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

fn cmd_set_active(app: &App, active: bool, now: Timestamp) -> Result<()> {
    app.firewall.set_active(active);
    app.save(now)?;
    info!(active, "firewall state changed");
    println!("Firewall {}", if active { "activated" } else { "deactivated" });
    Ok(())
}

fn cmd_status(app: &App, now: Timestamp) -> Result<()> {
    let settings = &app.runtime.firewall;
    let snapshot = app.config.snapshot();
    println!(
        "active={} rules={}/{} connections={}/{} log_entries={}/{}",
        if app.firewall.is_active() { "yes" } else { "no" },
        app.firewall.rule_count(),
        MAX_RULES,
        app.firewall.connections().snapshot(now).len(),
        settings.max_connections,
        app.firewall.log_count(),
        settings.max_logs,
    );
    println!(
        "inner={} ({}) outer={} ({}) idle_timeout={}s no_match={}",
        settings.topology.inner.name,
        settings.topology.inner.address,
        settings.topology.outer.name,
        settings.topology.outer.address,
        settings.idle_timeout,
        settings.no_match_action,
    );
    for route in &settings.proxies {
        println!(
            "proxy {} port {} -> {}",
            route.name, route.service_port, route.proxy_port
        );
    }
    println!(
        "config_root={} version={} tampered={} readonly={}",
        snapshot.paths.root.display(),
        snapshot.version,
        snapshot.tampered,
        std::env::var(CONFIG_READONLY_ENV).unwrap_or_else(|_| "unset".into()),
    );
    if snapshot.tampered {
        warn!(hash = %snapshot.hash_hex, "configuration changed since the last recorded version");
    }
    Ok(())
}

fn cmd_show_rules(app: &App) -> Result<()> {
    let rules = app.firewall.rules();
    if rules.is_empty() {
        println!("No rules loaded");
    }
    for (idx, rule) in rules.iter().enumerate() {
        println!("{idx:>3} {rule}");
    }
    Ok(())
}

fn cmd_load_rules(app: &App, file: &str, now: Timestamp) -> Result<()> {
    let paths = &app.config.paths;
    let source = resolve_under(&paths.root, file, false)?;
    let rules = load_rules(&source)?;
    if rules.len() > MAX_RULES {
        warn!(found = rules.len(), max = MAX_RULES, "rules beyond the limit are ignored");
    }
    write_rules(&paths.rules, &rules)?;
    let meta = app.config.record_version()?;
    let installed = app.firewall.replace_rules(rules);
    let dropped = app.firewall.clear_connections();
    app.save(now)?;
    println!(
        "Loaded {installed} rules (config version {}), cleared {dropped} connections",
        meta.version
    );
    Ok(())
}

fn cmd_clear_rules(app: &App, now: Timestamp) -> Result<()> {
    write_rules(&app.config.paths.rules, &[])?;
    let meta = app.config.record_version()?;
    app.firewall.clear_rules();
    let dropped = app.firewall.clear_connections();
    app.save(now)?;
    println!(
        "Cleared rules (config version {}), cleared {dropped} connections",
        meta.version
    );
    Ok(())
}

fn cmd_rollback_rules(app: &App, now: Timestamp) -> Result<()> {
    utils::enforce_writable(&app.config.paths.rules)?;
    let snapshot = app.config.rollback()?;
    let installed = app.firewall.replace_rules(load_rules(&app.config.paths.rules)?);
    let dropped = app.firewall.clear_connections();
    app.save(now)?;
    println!(
        "Rolled back to config version {} ({installed} rules), cleared {dropped} connections",
        snapshot.version
    );
    Ok(())
}

fn cmd_show_log(app: &App) -> Result<()> {
    let entries = app.firewall.log_entries();
    if entries.is_empty() {
        println!("Packet log is empty");
        return Ok(());
    }
    println!(
        "{:<19} {:<15} {:<15} {:>5} {:>5} {:>5} {:<4} {:<6} {:<24} {:>6}",
        "time", "src_ip", "dst_ip", "sport", "dport", "proto", "hook", "action", "reason", "count"
    );
    for entry in &entries {
        println!("{}", format_log_entry(entry));
    }
    Ok(())
}

fn format_log_entry(entry: &LogEntry) -> String {
    let time = i64::try_from(entry.timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| entry.timestamp.to_string());
    format!(
        "{:<19} {:<15} {:<15} {:>5} {:>5} {:>5} {:<4} {:<6} {:<24} {:>6}",
        time,
        entry.src_ip,
        entry.dst_ip,
        entry.src_port,
        entry.dst_port,
        entry.protocol,
        trace::hook_label(entry.hook),
        entry.action,
        entry.reason,
        entry.count,
    )
}

fn cmd_clear_log(app: &App, now: Timestamp) -> Result<()> {
    let cleared = app.firewall.log_count();
    app.firewall.clear_log();
    app.save(now)?;
    println!("Cleared {cleared} log entries");
    Ok(())
}

fn cmd_show_connections(app: &App, raw: bool, now: Timestamp) -> Result<()> {
    let connections = app.firewall.connections().snapshot(now);
    if connections.is_empty() && !raw {
        println!("No tracked connections");
    }
    for conn in &connections {
        if raw {
            println!("{}", conn.to_line());
        } else {
            println!("{conn}");
        }
    }
    Ok(())
}

fn cmd_clear_connections(app: &App, now: Timestamp) -> Result<()> {
    let removed = app.firewall.clear_connections();
    app.save(now)?;
    println!("Cleared {removed} connections");
    Ok(())
}

fn cmd_register_proxy_client(
    app: &App,
    client: SocketAddrV4,
    server: SocketAddrV4,
    port: u16,
    now: Timestamp,
) -> Result<()> {
    app.firewall
        .connections()
        .assign_proxy_client_port(client, server, port, now)?;
    app.save(now)?;
    println!("Registered proxy port {port} for {client} -> {server}");
    Ok(())
}

fn cmd_proxy_target(app: &App, client: SocketAddrV4, now: Timestamp) -> Result<()> {
    match app.firewall.connections().server_for_client(client, now) {
        Some(server) => {
            println!("{server}");
            Ok(())
        }
        None => bail!("no connection tracked for client {client}"),
    }
}

fn cmd_eval(
    app: &App,
    hook: HookPoint,
    in_iface: Option<&str>,
    out_iface: Option<&str>,
    now: Timestamp,
    packet_hex: &str,
) -> Result<()> {
    let bytes = hex_to_bytes(packet_hex)?;
    let mut packet = PacketBuf::new(bytes.clone());
    let verdict = app.firewall.process(hook, &mut packet, in_iface, out_iface, now);
    println!("verdict={} reason={}", verdict.action, verdict.reason);
    if packet.as_bytes() != bytes.as_slice() {
        println!("forged={}", hex::encode(packet.as_bytes()));
    }
    app.save(now)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    packets: usize,
    accepted: usize,
    dropped: usize,
    forged: usize,
    invalid: usize,
}

fn cmd_replay(app: &App, path: &Path, quiet: bool, now: Timestamp) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open trace {}", path.display()))?;
    let (summary, clock) = replay(&app.firewall, BufReader::new(file), quiet, now)?;
    app.save(clock)?;
    println!(
        "Replay done: packets={} accepted={} dropped={} forged={} invalid={} connections={} log_entries={}",
        summary.packets,
        summary.accepted,
        summary.dropped,
        summary.forged,
        summary.invalid,
        app.firewall.connections().snapshot(clock).len(),
        app.firewall.log_count(),
    );
    Ok(())
}

/// Lines without a timestamp reuse the last one seen, starting from `start`.
fn replay(
    firewall: &Firewall,
    reader: impl BufRead,
    quiet: bool,
    start: Timestamp,
) -> Result<(ReplaySummary, Timestamp)> {
    let mut summary = ReplaySummary::default();
    let mut clock = start;
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.context("read trace line")?;
        let record = match trace::parse_line(&line) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(error) => {
                warn!(line = lineno, %error, "skipping trace line");
                summary.invalid += 1;
                continue;
            }
        };
        if let Some(at) = record.at {
            clock = at;
        }
        let mut packet = PacketBuf::new(record.packet);
        let before = packet.clone();
        let verdict = firewall.process(
            record.hook,
            &mut packet,
            record.in_iface.as_deref(),
            record.out_iface.as_deref(),
            clock,
        );
        summary.packets += 1;
        if verdict.is_accept() {
            summary.accepted += 1;
        } else {
            summary.dropped += 1;
        }
        let forged = packet != before;
        if forged {
            summary.forged += 1;
        }
        if !quiet {
            println!(
                "{lineno:>5} t={clock} {} {} ({}){}",
                trace::hook_label(record.hook),
                verdict.action,
                verdict.reason,
                if forged { " forged" } else { "" },
            );
        }
    }
    Ok((summary, clock))
}
