use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use tracing::{info, warn};

use rtc_edge::config::DeviceConfig;
use rtc_edge::ids::RandomIds;
use rtc_edge::media::negotiator::{self, CodecNegotiator, Direction, TrackNegotiator};
use rtc_edge::peer::webrtc::WebRtcPeerFactory;
use rtc_edge::telemetry::logging::{self, LogConfig, LogLevel};
use rtc_edge::transport::tcp::{LocalTransport, TcpNetwork};
use rtc_edge::{ConnectionRef, Device, MediaTrack, ProtocolVersion, TrackError};

#[derive(Parser, Debug)]
#[command(
    name = "rtc-edge",
    about = "Serve WebRTC signaling for a device over TCP stand-in streams",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH", env = "RTC_EDGE_CONFIG", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RTC_EDGE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RTC_EDGE_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig::from_env(self.level, self.file.clone())
    }
}

/// Restricts client-offered tracks to the configured codecs.
struct TrackPolicy {
    video: CodecNegotiator,
    audio: CodecNegotiator,
}

impl TrackPolicy {
    fn accept(&self, connection: ConnectionRef, track: MediaTrack) {
        let kind = rtc_edge::media::sdp::media_kind(&rtc_edge::media::sdp::with_media_prefix(&track.sdp()))
            .map(str::to_owned);
        let negotiator = match kind.as_deref() {
            Some("video") => &self.video,
            Some("audio") => &self.audio,
            _ => {
                track.set_error_state(TrackError::InvalidCodecs);
                return;
            }
        };
        let payload_type = negotiator.match_track(&track);
        if payload_type == 0 {
            info!(%connection, track = track.track_id(), "no supported codec offered");
            track.set_error_state(TrackError::InvalidCodecs);
            return;
        }
        info!(%connection, track = track.track_id(), payload_type, "track accepted");
        let id = track.track_id().to_owned();
        track.set_receive_callback(move |packet| {
            tracing::trace!(track = %id, len = packet.len(), "rtp received");
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let config = DeviceConfig::load(cli.config.as_deref())?;
    let video = negotiator::profile_by_name(&config.video_codec)
        .with_context(|| format!("unsupported video codec {}", config.video_codec))?;

    let ids = Arc::new(RandomIds::new());
    let policy = Arc::new(TrackPolicy {
        video: CodecNegotiator::new(video, Direction::RecvOnly, ids.clone()),
        audio: CodecNegotiator::new(negotiator::OPUS, Direction::RecvOnly, ids.clone()),
    });

    let runtime = tokio::runtime::Handle::current();
    let network = TcpNetwork::new();
    let v1 = network
        .bind_streams(SocketAddr::new(config.bind, config.v1_port))
        .await
        .context("failed to bind v1 signaling port")?;
    let v2 = network
        .bind_streams(SocketAddr::new(config.bind, config.v2_port))
        .await
        .context("failed to bind v2 signaling port")?;
    let requests = network
        .bind_requests(SocketAddr::new(config.bind, config.info_port))
        .await
        .context("failed to bind discovery port")?;
    let discovery = requests.local_addr();

    let allow = config.allow.clone();
    let echo = config.echo_channels;
    let mut builder = Device::builder(
        runtime.clone(),
        LocalTransport::new(config.ice_servers.clone()),
        Arc::new(WebRtcPeerFactory::new(runtime)?),
    )
    .config(config.signaling.clone())
    .ids(ids)
    .access_control(move |_: ConnectionRef, action: &str| allow.iter().any(|allowed| allowed == action))
    .on_track(move |connection, track| policy.accept(connection, track))
    .on_metadata(|connection, metadata| info!(%connection, %metadata, "client metadata"));
    if echo {
        builder = builder.on_datachannel(|connection, channel| {
            info!(%connection, label = channel.label(), "echoing data channel");
            let echo = channel.clone();
            channel.set_message_callback(move |kind, data| {
                if !echo.send(data, kind) {
                    warn!(label = echo.label(), "echo on closed channel");
                }
            });
        });
    }
    let (mut device, worker) = builder.build();
    device.listen(ProtocolVersion::V1, v1);
    device.listen(ProtocolVersion::V2, v2);
    device.serve_info(requests);
    let info = device.signaling_info();
    info!(v1 = ?info.v1_port, v2 = ?info.v2_port, %discovery, "device ready");
    println!(
        "signaling v1 port {:?}, v2 port {:?}, discovery {discovery}",
        info.v1_port, info.v2_port
    );

    let handle = device.handle();
    let running = tokio::spawn(device.run(worker));
    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("shutting down");
    handle.shutdown();
    running.await.context("device worker panicked")?;
    Ok(())
}
