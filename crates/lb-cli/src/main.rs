use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use lb_core::{ProfileRequest, RulesBackend, SocketPairValidator};
use lb_ipt::IptablesBackend;
use lb_state::{ProfileStore, YamlStore};
use lb_sync::{SyncOptions, Synchronizer};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iptlb")]
#[command(version, about = "Weighted iptables load balancing profiles", long_about = None)]
struct Cli {
    /// Profile state file
    #[arg(
        long,
        global = true,
        env = "IPTLB_STATE",
        default_value = "/var/lib/iptlb/state.yaml"
    )]
    state: PathBuf,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, reset or delete a profile
    Apply(ApplyArgs),
    /// Re-apply every stored profile from the state file
    Replay {
        /// Only read the state, leave iptables untouched
        #[arg(long, env = "IPTLB_SKIP_RULES")]
        skip_rules: bool,
    },
    /// List stored profiles
    List {
        #[arg(long)]
        json: bool,
    },
    /// Compare live rules with the stored profiles
    Status {
        /// Limit the report to one profile
        #[arg(long, env = "IPTLB_PROFILE")]
        profile: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct ApplyArgs {
    /// Profile name
    #[arg(long, env = "IPTLB_PROFILE")]
    profile: String,

    /// Balanced address, ipv4:port
    #[arg(long, env = "IPTLB_SRC_ADDR")]
    src_addr: Option<String>,

    /// Backends receiving the traffic, comma separated ipv4:port list
    #[arg(long, env = "IPTLB_DEST_ADDR", value_delimiter = ',')]
    dest_addr: Option<Vec<String>>,

    #[arg(long, env = "IPTLB_PROTOCOL")]
    protocol: Option<String>,

    /// Kernel log level for LOG rules
    #[arg(long, env = "IPTLB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log matched packets (`--logging=false` turns it off on reset)
    #[arg(
        long,
        env = "IPTLB_LOGGING",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    logging: Option<bool>,

    /// Where the jump rule goes: client (OUTPUT), proxy (PREROUTING), server (INPUT)
    #[arg(long, env = "IPTLB_RULES_BACKEND")]
    rules_backend: Option<RulesBackend>,

    /// Remove the profile, its rules and its chain
    #[arg(long, env = "IPTLB_DELETE")]
    delete: bool,

    /// Delete and recreate the profile, keeping stored values not given here
    #[arg(long, env = "IPTLB_RESET")]
    reset: bool,

    /// Only update the state file
    #[arg(long, env = "IPTLB_SKIP_RULES")]
    skip_rules: bool,

    /// Take the profile from the state file instead of rewriting it
    #[arg(long, env = "IPTLB_USE_STATE")]
    use_state: bool,
}

impl ApplyArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            delete: self.delete,
            reset: self.reset,
            create_rules: !self.skip_rules,
            use_state: self.use_state,
        }
    }

    fn request(&self) -> ProfileRequest {
        ProfileRequest {
            source: self.src_addr.clone(),
            destinations: self.dest_addr.clone(),
            protocol: self.protocol.clone(),
            log_level: self.log_level.clone(),
            logging_enabled: self.logging,
            rules_backend: self.rules_backend,
            ..ProfileRequest::new(self.profile.as_str())
        }
    }
}

type IptSynchronizer = Synchronizer<IptablesBackend, YamlStore, SocketPairValidator>;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Apply(args) => handle_apply(&cli.state, args)?,
        Commands::Replay { skip_rules } => handle_replay(&cli.state, skip_rules)?,
        Commands::List { json } => handle_list(&cli.state, json)?,
        Commands::Status { profile, json } => handle_status(&cli.state, profile, json)?,
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(state: &Path) -> anyhow::Result<YamlStore> {
    YamlStore::open(state).with_context(|| format!("failed to open state file {}", state.display()))
}

fn open_synchronizer(state: &Path, options: SyncOptions) -> anyhow::Result<IptSynchronizer> {
    let store = open_store(state)?;
    let backend = IptablesBackend::new().context("failed to initialise iptables")?;
    debug!(state = %state.display(), ?options, "Synchronizer ready");
    Ok(Synchronizer::new(backend, store, SocketPairValidator, options))
}

fn handle_apply(state: &Path, args: ApplyArgs) -> anyhow::Result<()> {
    let options = args.options();
    let request = args.request();
    let mut sync = open_synchronizer(state, options)?;

    sync.configure(&request)
        .with_context(|| format!("failed to apply profile [{}]", request.name))?;

    if options.delete {
        println!("🗑️  Profile {} deleted", request.name);
    } else if options.reset {
        println!("🔄 Profile {} reset", request.name);
    } else {
        println!("✅ Profile {} applied", request.name);
    }
    Ok(())
}

fn handle_replay(state: &Path, skip_rules: bool) -> anyhow::Result<()> {
    let options = SyncOptions {
        create_rules: !skip_rules,
        ..Default::default()
    };
    let mut sync = open_synchronizer(state, options)?;

    let count = sync
        .replay_all()
        .with_context(|| format!("replay of {} aborted", state.display()))?;

    println!("✅ Replayed {} profile(s)", count);
    Ok(())
}

fn handle_list(state: &Path, json: bool) -> anyhow::Result<()> {
    let profiles = ProfileStore::new(open_store(state)?)
        .list()
        .context("failed to read stored profiles")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    println!("📋 Profiles ({}):", profiles.len());
    if profiles.is_empty() {
        println!("  (none)");
    }
    for profile in &profiles {
        let logging = if profile.logging_enabled {
            format!(", log level {}", profile.log_level)
        } else {
            String::new()
        };
        println!(
            "  • {} {}/{} -> {} [{}{}]",
            profile.name,
            profile.protocol,
            profile.source,
            profile.destinations.join(", "),
            profile.rules_backend,
            logging
        );
    }
    Ok(())
}

fn handle_status(state: &Path, profile: Option<String>, json: bool) -> anyhow::Result<()> {
    let sync = open_synchronizer(state, SyncOptions::default())?;

    let names = match profile {
        Some(name) => vec![name],
        None => sync
            .profiles()
            .names()
            .context("failed to read stored profiles")?,
    };

    let mut reports = Vec::with_capacity(names.len());
    for name in &names {
        let status = sync
            .status(name)
            .with_context(|| format!("failed to inspect profile [{}]", name))?;
        reports.push(status);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No profiles stored in {}", state.display());
    }
    for report in &reports {
        report.display();
        println!();
    }

    if reports.iter().any(|r| !r.is_converged()) {
        anyhow::bail!("some profiles are not fully applied; run `iptlb replay` to restore them");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_flags_build_request() {
        let cli = Cli::try_parse_from([
            "iptlb",
            "apply",
            "--profile",
            "web",
            "--src-addr",
            "10.0.0.5:8080",
            "--dest-addr",
            "10.0.0.6:9090,10.0.0.7:9090",
            "--rules-backend",
            "proxy",
            "--logging",
            "--reset",
        ])
        .unwrap();

        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        let request = args.request();
        assert_eq!(request.name, "web");
        assert_eq!(
            request.destinations,
            Some(vec!["10.0.0.6:9090".to_string(), "10.0.0.7:9090".to_string()])
        );
        assert_eq!(request.rules_backend, Some(RulesBackend::Proxy));
        assert_eq!(request.logging_enabled, Some(true));
        assert!(request.protocol.is_none());

        let options = args.options();
        assert!(options.reset);
        assert!(!options.delete);
        assert!(options.create_rules);
    }

    #[test]
    fn logging_can_be_switched_off() {
        let cli = Cli::try_parse_from(["iptlb", "apply", "--profile", "web", "--logging=false"])
            .unwrap();
        match cli.command {
            Commands::Apply(args) => assert_eq!(args.logging, Some(false)),
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn unknown_rules_backend_is_rejected() {
        assert!(
            Cli::try_parse_from([
                "iptlb",
                "apply",
                "--profile",
                "web",
                "--rules-backend",
                "router",
            ])
            .is_err()
        );
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["iptlb", "list", "--json", "--state", "/tmp/lb.yaml", "-vv"])
            .unwrap();
        assert_eq!(cli.state, PathBuf::from("/tmp/lb.yaml"));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::List { json: true }));
    }
}
