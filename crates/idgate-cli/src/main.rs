use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

mod gate_check;

#[zbus::proxy(
    interface = "org.idgate.Verify1",
    default_service = "org.idgate.Verify1",
    default_path = "/org/idgate/Verify1"
)]
trait Verify {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_devices(&self) -> zbus::Result<String>;
    async fn start_capture(&self, device_id: &str, kind: &str) -> zbus::Result<String>;
    async fn switch_camera(&self) -> zbus::Result<String>;
    async fn capture(&self) -> zbus::Result<String>;
    async fn retake(&self) -> zbus::Result<String>;
    async fn stop_capture(&self) -> zbus::Result<()>;
    async fn confirm_upload(&self, kind: &str, user_id: &str, country: &str) -> zbus::Result<String>;
    async fn start_liveness_attempt(&self) -> zbus::Result<String>;
    async fn complete_liveness_attempt(&self, session_id: &str) -> zbus::Result<String>;
    async fn cancel_liveness_attempt(&self) -> zbus::Result<bool>;
    async fn restart(&self) -> zbus::Result<()>;
    async fn fetch_object(&self, url: &str) -> zbus::Result<(String, Vec<u8>)>;

    #[zbus(signal)]
    async fn frame_verdict(&self, update: &str) -> zbus::Result<()>;
    #[zbus(signal)]
    async fn attempt_resolved(&self, report: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "idgate", version, about = "ID document capture and liveness verification")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true, env = "IDGATE_SESSION_BUS")]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the frame quality gate on an image file, no daemon needed.
    Gate {
        image: PathBuf,
        /// Threshold profile: baseline or loose.
        #[arg(long, default_value = "baseline")]
        profile: String,
        /// Crop to the centred guide for this document kind first.
        #[arg(long)]
        kind: Option<String>,
    },
    /// Daemon and run status.
    Status,
    /// List usable cameras, best first.
    Devices,
    /// Open a camera and start gating frames.
    Start {
        /// Pin this camera instead of the best-ranked one.
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value = "national_id")]
        kind: String,
    },
    /// Switch to the camera facing the other way.
    Switch,
    /// Print frame verdicts and attempt results as they arrive.
    Watch,
    /// Take the accepted frame; optionally write the JPEG out.
    Capture {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Drop the capture and reopen the same camera.
    Retake,
    /// Close the camera.
    Stop,
    /// Upload the captured document and attach it to the run.
    Submit {
        /// ISO 3166-1 alpha-2 country of issue.
        #[arg(long)]
        country: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// Liveness attempts.
    Liveness {
        #[command(subcommand)]
        action: LivenessAction,
    },
    /// Abandon the run and go back to the start.
    Restart,
    /// Download an object through a signed URL.
    Fetch {
        url: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum LivenessAction {
    /// Create a session and print its id.
    Start,
    /// Wait for a session to finish and record the attempt.
    Complete { session_id: String },
    /// Abandon the attempt in flight.
    Cancel,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Command::Gate {
            image,
            profile,
            kind,
        } => return gate_check::run(&image, &profile, kind.as_deref()),
        other => other,
    };

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = VerifyProxy::new(&conn)
        .await
        .context("idgated is not reachable")?;

    match command {
        Command::Gate { .. } => {}
        Command::Status => print_json(&proxy.status().await?)?,
        Command::Devices => print_json(&proxy.list_devices().await?)?,
        Command::Start { device, kind } => {
            let device = proxy
                .start_capture(device.as_deref().unwrap_or(""), &kind)
                .await?;
            println!("capturing from {device}");
        }
        Command::Switch => print_json(&proxy.switch_camera().await?)?,
        Command::Watch => watch(&proxy).await?,
        Command::Capture { out } => {
            let reply: serde_json::Value = serde_json::from_str(&proxy.capture().await?)?;
            if let Some(path) = out {
                let b64 = reply["jpeg_base64"]
                    .as_str()
                    .context("daemon reply has no image")?;
                let jpeg = base64::engine::general_purpose::STANDARD.decode(b64)?;
                std::fs::write(&path, &jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("wrote {} ({} bytes)", path.display(), jpeg.len());
            }
            println!(
                "captured {}x{} from {}",
                reply["width"], reply["height"], reply["device_id"]
            );
        }
        Command::Retake => println!("capturing from {}", proxy.retake().await?),
        Command::Stop => proxy.stop_capture().await?,
        Command::Submit {
            country,
            kind,
            user,
        } => {
            let receipt = proxy
                .confirm_upload(
                    kind.as_deref().unwrap_or(""),
                    user.as_deref().unwrap_or(""),
                    &country,
                )
                .await?;
            print_json(&receipt)?;
        }
        Command::Liveness { action } => match action {
            LivenessAction::Start => println!("{}", proxy.start_liveness_attempt().await?),
            LivenessAction::Complete { session_id } => {
                print_json(&proxy.complete_liveness_attempt(&session_id).await?)?
            }
            LivenessAction::Cancel => {
                if proxy.cancel_liveness_attempt().await? {
                    println!("attempt cancelled");
                } else {
                    println!("no attempt in flight");
                }
            }
        },
        Command::Restart => proxy.restart().await?,
        Command::Fetch { url, out } => {
            let (content_type, bytes) = proxy.fetch_object(&url).await?;
            std::fs::write(&out, &bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("wrote {} ({content_type}, {} bytes)", out.display(), bytes.len());
        }
    }

    Ok(())
}

async fn watch(proxy: &VerifyProxy<'_>) -> Result<()> {
    let mut frames = proxy.receive_frame_verdict().await?;
    let mut attempts = proxy.receive_attempt_resolved().await?;
    let mut last_accepted = None;

    loop {
        tokio::select! {
            Some(signal) = frames.next() => {
                let args = signal.args()?;
                let update: serde_json::Value = serde_json::from_str(args.update())?;
                let accepted = update["verdict"]["accepted"].as_bool();
                // Only print changes; the daemon sends every frame.
                if accepted != last_accepted {
                    println!("frame {}", args.update());
                    last_accepted = accepted;
                }
            }
            Some(signal) = attempts.next() => {
                let args = signal.args()?;
                println!("attempt {}", args.report());
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
            else => bail!("daemon went away"),
        }
    }
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
