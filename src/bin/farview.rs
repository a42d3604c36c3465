//! Remote camera viewing utility.
//!
//! Usage: farview [OPTIONS] [endpoint-id]
//!
//! Options:
//!   --config <dir>       path to alternative farview config directory
//!   -l, --listen         listen for incoming fetch requests
//!   -a <endpoint-id>     accept fetches from this identity (repeatable)
//!   -b, --announce <s>   announce interval in seconds (min 60)
//!   -q, --quality <n>    image quality (0-100)
//!   -W, --width <px>     output width in pixels
//!   -H, --height <px>    output height in pixels
//!   -o, --output <path>  write fetched image to this file
//!   --camera <index>     capture device index (default 0)
//!
//! Examples:
//!   farview --listen -a 3fa0...                  # serve frames to one identity
//!   farview -q 50 -W 640 -H 480 3fa0...          # fetch one frame
//!   farview -o frame.jpg 3fa0...                 # fetch and save

use std::path::PathBuf;

use anyhow::Result;

use farview::{Fetcher, FrameRequest};

struct Args {
    config: Option<String>,
    listen: bool,
    allowed: Vec<String>,
    announce: Option<u64>,
    quality: Option<u8>,
    width: Option<u32>,
    height: Option<u32>,
    output: Option<String>,
    camera: u32,
    destination: Option<String>,
}

/// Parse the command line. `Ok(None)` means help was requested; a usage
/// error carries the message to print before exiting non-zero.
fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let mut config = None;
    let mut listen = false;
    let mut allowed = Vec::new();
    let mut announce = None;
    let mut quality = None;
    let mut width = None;
    let mut height = None;
    let mut output = None;
    let mut camera = 0u32;
    let mut destination = None;
    let mut i = 1;

    fn value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    }

    fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, String> {
        raw.parse()
            .map_err(|_| format!("Invalid value {:?} for {}", raw, flag))
    }

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--config" => {
                config = Some(value(args, i, "--config")?);
                i += 2;
            }
            "-l" | "--listen" => {
                listen = true;
                i += 1;
            }
            "-a" => {
                allowed.push(value(args, i, "-a")?);
                i += 2;
            }
            "-b" | "--announce" => {
                announce = Some(number(&value(args, i, "--announce")?, "--announce")?);
                i += 2;
            }
            "-q" | "--quality" => {
                let q: u32 = number(&value(args, i, "--quality")?, "--quality")?;
                if q > 100 {
                    return Err("Quality must be 0-100".to_string());
                }
                quality = Some(q as u8);
                i += 2;
            }
            "-W" | "--width" => {
                width = Some(number(&value(args, i, "--width")?, "--width")?);
                i += 2;
            }
            "-H" | "--height" => {
                height = Some(number(&value(args, i, "--height")?, "--height")?);
                i += 2;
            }
            "-o" | "--output" => {
                output = Some(value(args, i, "--output")?);
                i += 2;
            }
            "--camera" => {
                camera = number(&value(args, i, "--camera")?, "--camera")?;
                i += 2;
            }
            "-h" | "--help" => {
                return Ok(None);
            }
            _ => {
                if arg.starts_with('-') {
                    return Err(format!("Unknown option {}", arg));
                }
                if destination.is_some() {
                    return Err("More than one destination given".to_string());
                }
                destination = Some(arg.clone());
                i += 1;
            }
        }
    }

    if !listen && destination.is_none() {
        return Err("An endpoint id is required unless --listen is given".to_string());
    }

    Ok(Some(Args {
        config,
        listen,
        allowed,
        announce,
        quality,
        width,
        height,
        output,
        camera,
        destination,
    }))
}

fn print_usage() {
    println!("Usage: farview [OPTIONS] [endpoint-id]");
    println!();
    println!("Options:");
    println!("  --config <dir>       path to alternative farview config directory");
    println!("  -l, --listen         listen for incoming fetch requests");
    println!("  -a <endpoint-id>     accept fetches from this identity (repeatable)");
    println!("  -b, --announce <s>   announce interval in seconds (min 60)");
    println!("  -q, --quality <n>    image quality (0-100)");
    println!("  -W, --width <px>     output width in pixels");
    println!("  -H, --height <px>    output height in pixels");
    println!("  -o, --output <path>  write fetched image to this file");
    println!("  --camera <index>     capture device index (default 0)");
    println!();
    println!("Without --listen, fetches one frame from <endpoint-id> and exits.");

    #[cfg(feature = "camera")]
    {
        println!();
        println!("Available cameras:");
        match farview::list_cameras() {
            Ok(cameras) if cameras.is_empty() => println!("  (none found)"),
            Ok(cameras) => {
                for cam in cameras {
                    println!("  {} - {}", cam.path.display(), cam.name);
                }
            }
            Err(e) => println!("  Error listing cameras: {}", e),
        }
    }
}

fn config_dir(arg: Option<&str>) -> PathBuf {
    match arg {
        Some(dir) => PathBuf::from(expand_home(dir)),
        None => PathBuf::from(expand_home("~/.config/farview")),
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, rest);
        }
    }
    path.to_string()
}

async fn run_listener(args: Args) -> Result<()> {
    #[cfg(not(feature = "camera"))]
    {
        let _ = &args;
        anyhow::bail!("This build has no camera support (rebuild with --features camera)");
    }

    #[cfg(feature = "camera")]
    {
        use farview::{Listener, ListenerConfig};
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let mut config = ListenerConfig::new(config_dir(args.config.as_deref()));
        config.camera_index = args.camera;
        config.announce_interval = args.announce.map(Duration::from_secs);
        for a in &args.allowed {
            config.allowed.push(farview::net::parse_endpoint_id(a)?);
        }
        if let Some(q) = args.quality {
            config.settings.quality = q;
        }
        if let Some(w) = args.width {
            config.settings.width = w;
        }
        if let Some(h) = args.height {
            config.settings.height = h;
        }

        let listener = Listener::bind(config).await?;
        tracing::info!("farview listening on {}", listener.endpoint_id());
        if !args.allowed.is_empty() {
            tracing::info!("Accepting fetches from {} identities", args.allowed.len());
        }

        listener.run(CancellationToken::new()).await
    }
}

async fn run_fetch(args: Args) -> Result<()> {
    let destination = args.destination.as_deref().expect("destination checked in parse");
    let remote = farview::net::parse_endpoint_id(destination)?;

    // The fetcher keeps its own identity so listeners can allow-list it.
    let config_dir = config_dir(args.config.as_deref());
    let identity = farview::net::load_or_create_identity(&config_dir)?;
    tracing::debug!("Fetching as {}", identity.public());

    let request = FrameRequest {
        quality: args.quality,
        width: args.width,
        height: args.height,
    };

    let mut fetcher = Fetcher::new(remote, request).with_identity(identity);
    let result = match fetcher.fetch().await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    tracing::info!(
        "Received {}x{} image ({} bytes)",
        result.frame.width,
        result.frame.height,
        result.raw.len()
    );

    let path = match args.output.as_deref() {
        Some(path) => PathBuf::from(expand_home(path)),
        None => {
            let stamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            PathBuf::from(format!("farview-{}.jpg", stamp))
        }
    };

    tracing::info!("Writing frame to {}", path.display());
    std::fs::write(&path, &result.raw)?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("farview=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(Some(a)) => a,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(msg) => {
            eprintln!("Error: {}", msg);
            eprintln!("Try 'farview --help' for usage.");
            std::process::exit(2);
        }
    };

    if args.listen {
        run_listener(args).await
    } else {
        run_fetch(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("farview")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_unknown_option_is_a_usage_error() {
        assert!(parse_args(&argv(&["--frobnicate", "someid"])).is_err());
    }

    #[test]
    fn test_malformed_values_are_usage_errors() {
        assert!(parse_args(&argv(&["-q", "banana", "someid"])).is_err());
        assert!(parse_args(&argv(&["-q", "150", "someid"])).is_err());
        assert!(parse_args(&argv(&["-W", "wide", "someid"])).is_err());
        assert!(parse_args(&argv(&["-W"])).is_err());
    }

    #[test]
    fn test_missing_destination_is_a_usage_error() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["-q", "50"])).is_err());
    }

    #[test]
    fn test_help_is_not_an_error() {
        assert!(matches!(parse_args(&argv(&["--help"])), Ok(None)));
        assert!(matches!(parse_args(&argv(&["-h"])), Ok(None)));
    }

    #[test]
    fn test_fetch_arguments() {
        let args = parse_args(&argv(&["-q", "50", "-W", "640", "-H", "480", "someid"]))
            .unwrap()
            .unwrap();
        assert!(!args.listen);
        assert_eq!(args.quality, Some(50));
        assert_eq!(args.width, Some(640));
        assert_eq!(args.height, Some(480));
        assert_eq!(args.destination.as_deref(), Some("someid"));
    }

    #[test]
    fn test_listen_needs_no_destination() {
        let args = parse_args(&argv(&["--listen", "-a", "peer1", "-a", "peer2"]))
            .unwrap()
            .unwrap();
        assert!(args.listen);
        assert_eq!(args.allowed, vec!["peer1", "peer2"]);
    }
}
