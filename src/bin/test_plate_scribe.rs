use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plate_scribe::api::{PredictOutcome, PredictResponse};
use reqwest::{Body, Client, multipart};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

// Simple test client to send multiple plate images to the plate scribe service
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Load test client for /predict")]
struct Args {
    /// Origin for the requests
    #[clap(short, long, default_value = "http://127.0.0.1:8001")]
    origin: String,

    /// Image of a car with a plate to upload
    #[clap(short, long)]
    image: String,

    /// Number of requests to make
    #[clap(short, long, default_value_t = 1)]
    number_of_requests: u32,

    /// Interval in milliseconds for making requests
    #[clap(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut futures = Vec::with_capacity(args.number_of_requests as usize);

    let pb = ProgressBar::new(args.number_of_requests as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    println!(
        "Calling {}, {} times with {} ms interval",
        args.origin, args.number_of_requests, args.interval
    );

    let start_time = Instant::now();
    for i in 0..args.number_of_requests {
        futures.push(tokio::task::spawn(send_predict_request(
            args.origin.clone(),
            args.image.clone(),
        )));
        pb.inc(1);
        if i + 1 < args.number_of_requests {
            tokio::time::sleep(Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    pb.finish_with_message("All requests completed!");
    let runtime_duration = start_time.elapsed();

    let mut request_times: Vec<Duration> = Vec::with_capacity(results.len());
    let mut last_plate: Option<PredictResponse> = None;
    let mut errors = 0;
    for result in results {
        match result {
            Ok(Ok((PredictOutcome::Plate(plate), elapsed))) => {
                request_times.push(elapsed);
                last_plate = Some(*plate);
            }
            Ok(Ok((PredictOutcome::Error(error), elapsed))) => {
                request_times.push(elapsed);
                eprintln!("Service answered: {}", error.error);
                errors += 1;
            }
            Ok(Err(e)) => {
                eprintln!("Request failed: {e:#}");
                errors += 1;
            }
            Err(e) => {
                eprintln!("Request task failed: {e}");
                errors += 1;
            }
        }
    }

    if let Some(plate) = last_plate {
        println!("Plate: {:?} ({:?})", plate.plate_text, plate.plate_parts);
        println!("Glyphs: {:#?}", plate.crop_boxes);
    }
    println!("Errors: {errors}");
    println!("Runtime duration: {:?}", runtime_duration);

    match (request_times.iter().min(), request_times.iter().max()) {
        (Some(min_duration), Some(max_duration)) => {
            let avg_duration =
                request_times.iter().sum::<Duration>() / request_times.len() as u32;
            println!(
                "Request times -- min: {:?}, avg: {:?}, max: {:?}",
                min_duration, avg_duration, max_duration
            );
        }
        _ => println!("No request times to summarize"),
    }

    Ok(())
}

async fn send_predict_request(
    origin: String,
    image: String,
) -> anyhow::Result<(PredictOutcome, Duration)> {
    let url = reqwest::Url::parse(&origin)?.join("predict")?;
    let client = Client::new();

    let file = File::open(&image).await?;
    let stream = FramedRead::new(file, BytesCodec::new());
    let image_part = multipart::Part::stream(Body::wrap_stream(stream)).file_name("image.jpg");
    let form = multipart::Form::new().part("file", image_part);

    let request_start_time = Instant::now();
    let response = client.post(url).multipart(form).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Request failed with status {status}: {body}");
    }
    let outcome = response.json::<PredictOutcome>().await?;
    Ok((outcome, request_start_time.elapsed()))
}
