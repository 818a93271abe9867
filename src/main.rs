mod config;
mod fs;
mod logging;
mod session;
mod tree;

use std::path::{Path, PathBuf};

use fuser::MountOption;

use logging::FileLogger;

const USAGE: &str = "\
usage: arsenal cfg=<config.xml> [FUSE options] <mountpoint>

  cfg=<path>        path to the XML configuration file (required)
  -o opt[,opt...]   mount options, forwarded to the kernel bridge
  -V, --version     print version and exit
  -h, --help        print this help and exit
";

struct ParsedArgs {
    cfg_path: Option<String>,
    mount_point: Option<String>,
    mount_options: Vec<MountOption>,
    show_version: bool,
    show_help: bool,
}

fn parse_args(args: &[String]) -> ParsedArgs {
    let mut parsed = ParsedArgs {
        cfg_path: None,
        mount_point: None,
        mount_options: Vec::new(),
        show_version: false,
        show_help: false,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if let Some(rest) = arg.strip_prefix("cfg=") {
            parsed.cfg_path = Some(rest.to_string());
        } else if arg == "-V" || arg == "--version" {
            parsed.show_version = true;
        } else if arg == "-h" || arg == "--help" {
            parsed.show_help = true;
        } else if arg == "-o" {
            i += 1;
            if let Some(opts) = args.get(i) {
                parsed.mount_options.extend(parse_mount_options(opts));
            }
        } else if let Some(opts) = arg.strip_prefix("-o") {
            parsed.mount_options.extend(parse_mount_options(opts));
        } else if let Some(rest) = arg.strip_prefix('-') {
            // Any other flag-shaped argument is forwarded verbatim to the
            // kernel bridge rather than rejected — the bridge understands
            // options this binary has no reason to know about.
            parsed.mount_options.push(MountOption::CUSTOM(rest.to_string()));
        } else {
            parsed.mount_point = Some(arg.to_string());
        }
        i += 1;
    }

    parsed
}

fn parse_mount_options(opts: &str) -> Vec<MountOption> {
    opts.split(',')
        .filter(|s| !s.is_empty())
        .map(|opt| match opt {
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            other => MountOption::CUSTOM(other.to_string()),
        })
        .collect()
}

fn log_file_path() -> PathBuf {
    std::env::var("ARSENAL_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/arsenal.log"))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = parse_args(&args);

    if parsed.show_help {
        print!("{USAGE}");
        return;
    }
    if parsed.show_version {
        println!("arsenal {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(cfg_path) = parsed.cfg_path else {
        eprintln!("arsenal: missing required cfg=<path> argument\n");
        eprint!("{USAGE}");
        std::process::exit(1);
    };
    let Some(mount_point) = parsed.mount_point else {
        eprintln!("arsenal: missing mount point\n");
        eprint!("{USAGE}");
        std::process::exit(1);
    };

    match FileLogger::open(&log_file_path(), FileLogger::level_from_env()) {
        Ok(logger) => {
            if let Err(e) = logger.install() {
                eprintln!("arsenal: warning: could not install logger: {e}");
            }
        }
        Err(e) => eprintln!("arsenal: warning: could not open log file: {e}"),
    }

    log::info!("loading configuration from {cfg_path}");
    let root = match config::load(Path::new(&cfg_path), &mount_point) {
        Ok(root) => root,
        Err(e) => {
            log::error!("failed to load configuration: {e}");
            eprintln!("arsenal: {e}");
            std::process::exit(1);
        }
    };

    let mut options = parsed.mount_options;
    options.push(MountOption::FSName("arsenal".to_string()));

    log::info!("mounting arsenal at {mount_point}");
    let adapter = fs::Adapter::new(root);
    if let Err(e) = fuser::mount2(adapter, &mount_point, &options) {
        log::error!("mount failed: {e}");
        eprintln!("arsenal: mount failed: {e}");
        std::process::exit(1);
    }
}
