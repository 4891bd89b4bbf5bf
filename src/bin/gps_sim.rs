//! GPS simulator: walks a straight track between two coordinates at a
//! constant speed and POSTs position batches to a RoutePulse server.
//!
//! ```bash
//! gps-sim --vehicle TRK-1 --from 30.0,-94.0 --to 30.01,-94.0 --speed-kph 60
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gps-sim")]
#[command(about = "Synthetic position source for RoutePulse")]
#[command(version)]
struct CliArgs {
    /// RoutePulse server base URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    /// Vehicle id to report positions for
    #[arg(long)]
    vehicle: String,

    /// Track start, "lat,lon"
    #[arg(long, default_value = "30.0,-94.0")]
    from: String,

    /// Track end, "lat,lon"
    #[arg(long, default_value = "30.01,-94.0")]
    to: String,

    /// Constant speed along the track (km/h)
    #[arg(long, default_value = "60.0")]
    speed_kph: f64,

    /// Seconds between reported fixes
    #[arg(long, default_value = "30")]
    interval_secs: u64,

    /// Reported accuracy radius (m)
    #[arg(long, default_value = "10.0")]
    accuracy: f64,

    /// Gaussian-ish jitter applied to each fix (m); 0 disables
    #[arg(long, default_value = "3.0")]
    jitter_m: f64,

    /// Send fixes at this multiple of real time (0 = as fast as possible)
    #[arg(long, default_value = "1")]
    time_scale: u64,
}

fn parse_coord(raw: &str) -> Result<(f64, f64)> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        bail!("expected lat,lon — got {raw}");
    }
    Ok((parts[0].trim().parse()?, parts[1].trim().parse()?))
}

/// Rough meters-per-degree at the given latitude.
fn meters_per_degree(lat: f64) -> (f64, f64) {
    let lat_m = 111_320.0;
    (lat_m, lat_m * lat.to_radians().cos())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let (from_lat, from_lon) = parse_coord(&args.from)?;
    let (to_lat, to_lon) = parse_coord(&args.to)?;

    let (m_per_lat, m_per_lon) = meters_per_degree(from_lat);
    let d_lat_m = (to_lat - from_lat) * m_per_lat;
    let d_lon_m = (to_lon - from_lon) * m_per_lon;
    let track_m = (d_lat_m * d_lat_m + d_lon_m * d_lon_m).sqrt();
    if track_m < 1.0 {
        bail!("track is shorter than a meter");
    }

    let speed_mps = args.speed_kph / 3.6;
    let step_m = speed_mps * args.interval_secs as f64;
    let steps = (track_m / step_m).ceil() as u64;

    info!(
        vehicle = %args.vehicle,
        track_m = track_m as u64,
        steps,
        speed_kph = args.speed_kph,
        "Starting simulated run"
    );

    let http = reqwest::Client::new();
    let url = format!("{}/api/v1/positions", args.server.trim_end_matches('/'));
    let mut rng = rand::thread_rng();

    for i in 0..=steps {
        let fraction = (i as f64 * step_m / track_m).min(1.0);
        let mut lat = from_lat + (to_lat - from_lat) * fraction;
        let mut lon = from_lon + (to_lon - from_lon) * fraction;
        if args.jitter_m > 0.0 {
            lat += rng.gen_range(-args.jitter_m..args.jitter_m) / m_per_lat;
            lon += rng.gen_range(-args.jitter_m..args.jitter_m) / m_per_lon;
        }
        // Roll to a stop on the final fix so arrival detection fires.
        let speed = if fraction >= 1.0 { 0.0 } else { speed_mps };

        let body = json!({
            "vehicle_id": args.vehicle,
            "points": [{
                "ts": chrono::Utc::now(),
                "lat": lat,
                "lon": lon,
                "speed": speed,
                "accuracy": args.accuracy,
            }],
        });

        match http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(step = i, fraction = format!("{fraction:.3}"), "Batch sent");
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                warn!(step = i, %status, body = %text, "Server rejected batch");
            }
            Err(e) => warn!(step = i, error = %e, "Send failed"),
        }

        if fraction >= 1.0 {
            break;
        }
        if args.time_scale > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(
                args.interval_secs / args.time_scale.max(1),
            ))
            .await;
        }
    }

    info!("Run complete");
    Ok(())
}
