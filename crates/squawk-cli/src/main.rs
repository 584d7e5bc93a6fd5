//! squawk: local loopback demo for the PTT radio stack.
//!
//! Runs two sessions against one in-memory store: ALPHA keys up on a
//! channel and transmits a short test tone (or the two-tone dispatch
//! page), BRAVO receives and logs every scheduled buffer, then the two
//! trade a radio message. Useful for eyeballing the arbitration, chunk
//! cadence, and gapless scheduling without a real backend or audio
//! device.

use std::f32::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use squawk_radio::playback::SystemClock;
use squawk_radio::{FeedbackPolicy, RadioConfig, RadioEvent, Session, SessionStreams};
use squawk_store::MemoryStore;

#[derive(Parser)]
#[command(name = "squawk", about = "Loopback demo for the squawk PTT radio")]
struct Args {
    /// TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel to transmit on.
    #[arg(long, default_value = "main")]
    channel: String,

    /// Seconds of test tone to transmit.
    #[arg(long, default_value_t = 2)]
    seconds: u64,

    /// Send the two-tone dispatch page instead of the test tone.
    #[arg(long, default_value_t = false)]
    page: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "squawk=info,squawk_radio=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RadioConfig::load(path)?,
        None => RadioConfig::default(),
    };
    if args.page {
        config.feedback = FeedbackPolicy::PagingTone;
    }
    let passphrase = config.passphrase.clone();
    let store = MemoryStore::new();

    let (alpha, _alpha_streams) = Session::login(
        Arc::new(store.clone()),
        config.clone(),
        "ALPHA",
        &passphrase,
        Arc::new(SystemClock::new()),
    )
    .await?;
    let (bravo, bravo_streams) = Session::login(
        Arc::new(store.clone()),
        config.clone(),
        "BRAVO",
        &passphrase,
        Arc::new(SystemClock::new()),
    )
    .await?;

    let monitor = tokio::spawn(monitor_bravo(bravo_streams));

    if args.page {
        tracing::info!(channel = %args.channel, "ALPHA sending dispatch page");
        if alpha.send_tone(&args.channel).await? {
            // Page runs ~7.8 s at the chunk cadence.
            tokio::time::sleep(Duration::from_secs(9)).await;
        }
    } else {
        tracing::info!(
            channel = %args.channel,
            seconds = args.seconds,
            "ALPHA keying up"
        );
        match alpha.begin_transmit(&args.channel).await? {
            Some(handle) => {
                // Feed 200 ms blocks of a 440 Hz sine at the wire rate,
                // standing in for a capture device.
                let rate = config.sample_rate;
                let block = (rate as u64 * config.chunk_interval_ms / 1000) as usize;
                let blocks = args.seconds * 1000 / config.chunk_interval_ms;
                let mut phase = 0usize;
                for _ in 0..blocks {
                    let samples: Vec<f32> = (0..block)
                        .map(|i| {
                            let t = (phase + i) as f32 / rate as f32;
                            (2.0 * PI * 440.0 * t).sin() * 0.4
                        })
                        .collect();
                    phase += block;
                    handle.push_block(&samples, rate);
                    tokio::time::sleep(Duration::from_millis(config.chunk_interval_ms)).await;
                }
                alpha.end_transmit().await?;
                tracing::info!("ALPHA released");
            }
            None => tracing::warn!("channel busy, nothing transmitted"),
        }
    }

    if let Some(key) = alpha.send_message("radio check, how copy?").await? {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bravo.reply_message(&key, "loud and clear").await?;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    alpha.logout().await?;
    bravo.logout().await?;
    monitor.abort();
    Ok(())
}

/// Log everything BRAVO's session observes.
async fn monitor_bravo(mut streams: SessionStreams) {
    loop {
        tokio::select! {
            event = streams.events.recv() => match event {
                Some(RadioEvent::Status(status)) => {
                    tracing::info!(?status, "BRAVO status");
                }
                Some(RadioEvent::ChannelActivity { channel, speaker }) => {
                    let speaker = speaker.map(|c| c.display_name);
                    tracing::info!(channel, ?speaker, "BRAVO channel activity");
                }
                Some(RadioEvent::Reconnecting) => tracing::warn!("BRAVO reconnecting"),
                Some(RadioEvent::Reconnected) => tracing::info!("BRAVO reconnected"),
                Some(RadioEvent::Message(event)) => {
                    tracing::info!(?event, "BRAVO message traffic");
                }
                None => break,
            },
            buffer = streams.audio.recv() => match buffer {
                Some(buffer) => {
                    tracing::info!(
                        channel = %buffer.channel,
                        start = buffer.start,
                        samples = buffer.samples.len(),
                        gain = buffer.gain,
                        "BRAVO scheduled audio"
                    );
                }
                None => break,
            },
        }
    }
}
