use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing_subscriber::EnvFilter;
use vidcast::{MediaTools, MulticastConfig, ScanLimits, Server, ServerConfig, SourceConfig};

#[derive(Parser)]
#[command(
    name = "vidcast",
    version,
    about = "RTSP server for H.264 files, pipes and live publishers"
)]
struct Args {
    /// Input to stream: a .ts file, a container (.mp4, .mov, ...) to
    /// transcode, or a named pipe. Without one, only ANNOUNCE publishers
    /// are served.
    input: Option<PathBuf>,

    /// RTSP listen address
    #[arg(long, default_value = "0.0.0.0:8554")]
    rtsp_address: String,

    /// UDP address for RTP
    #[arg(long, default_value = "0.0.0.0:8000")]
    udp_rtp_address: String,

    /// UDP address for RTCP
    #[arg(long, default_value = "0.0.0.0:8001")]
    udp_rtcp_address: String,

    /// Multicast address range (CIDR)
    #[arg(long, default_value = "224.1.0.0/16")]
    multicast_ip_range: String,

    /// Multicast RTP port
    #[arg(long, default_value_t = 8002)]
    multicast_rtp_port: u16,

    /// Multicast RTCP port
    #[arg(long, default_value_t = 8003)]
    multicast_rtcp_port: u16,

    /// PEM certificate chain; enables RTSP over TLS together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Frame rate assumed for raw pipes
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Hold back new readers until the next keyframe
    #[arg(long)]
    wait_for_keyframe: bool,

    /// Seconds to spend looking for SPS/PPS before streaming without them
    #[arg(long, default_value_t = 10)]
    probe_timeout: u64,

    /// Host advertised in SDP instead of the request host
    #[arg(long)]
    public_host: Option<String>,

    /// ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// ffprobe executable
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("vidcast: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let (network, prefix_len) = MulticastConfig::parse_range(&args.multicast_ip_range)
        .ok_or_else(|| format!("invalid multicast range: {}", args.multicast_ip_range))?;

    let tls = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
        _ => None,
    };

    let config = ServerConfig {
        rtsp_address: args.rtsp_address.clone(),
        udp_rtp_address: args.udp_rtp_address,
        udp_rtcp_address: args.udp_rtcp_address,
        multicast: MulticastConfig {
            network,
            prefix_len,
            rtp_port: args.multicast_rtp_port,
            rtcp_port: args.multicast_rtcp_port,
            ..MulticastConfig::default()
        },
        tls,
        public_host: args.public_host,
        wait_for_keyframe: args.wait_for_keyframe,
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);
    server.start()?;

    if let Some(input) = &args.input {
        let source = SourceConfig {
            nominal_fps: args.fps,
            probe: ScanLimits {
                timeout: Duration::from_secs(args.probe_timeout),
                ..ScanLimits::default()
            },
            tools: MediaTools {
                ffmpeg: args.ffmpeg.into(),
                ffprobe: args.ffprobe.into(),
            },
            ..SourceConfig::default()
        };
        server.publish_file(input, &source)?;
    }

    let scheme = if server.config().tls.is_some() { "rtsps" } else { "rtsp" };
    let addr = server.local_addr().map(|a| a.to_string()).unwrap_or(args.rtsp_address);
    println!("Serving {scheme}://{addr}/ (press Enter to stop)");

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => {
            // Detached from a terminal: run until killed.
            loop {
                thread::park();
            }
        }
        Ok(_) => {}
    }

    server.stop();
    Ok(())
}

fn load_tls(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>, Box<dyn Error>> {
    let certs = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key)?;
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
