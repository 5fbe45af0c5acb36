use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "clammit-cli")]
#[command(about = "Management CLI for clammit", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8438")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show scan engine connectivity and test scan results
    Info,
    /// Check whether the proxy is accepting requests
    Ready,
    /// Fire multipart uploads at the proxy
    Upload {
        /// File to send
        #[arg(short, long)]
        file: PathBuf,

        /// Form field name carrying the file
        #[arg(short, long, default_value = "qqfile")]
        param: String,

        /// Number of requests to send
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Path the uploads are posted to
        #[arg(long, default_value = "/foo")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Info => {
            let res = client.get(format!("{}/clammit", base)).send().await?;
            print_response(res).await?;
        }
        Commands::Ready => {
            let res = client.get(format!("{}/clammit/readyz", base)).send().await?;
            let status = res.status();
            if status.is_success() {
                println!("Ready ({})", status);
            } else {
                println!("Not ready ({})", status);
            }
        }
        Commands::Upload {
            file,
            param,
            count,
            path,
        } => {
            let data = tokio::fs::read(&file).await?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.dat".to_string());
            let url = format!("{}/{}", base, path.trim_start_matches('/'));

            let mut errors = 0;
            for i in 0..count {
                println!("Send request: {}", i);
                let form = Form::new().part(param.clone(), Part::bytes(data.clone()).file_name(name.clone()));
                match client.post(&url).multipart(form).send().await {
                    Ok(res) if res.status().as_u16() <= 299 => {}
                    Ok(res) => {
                        eprintln!("Request {} returned {}", i, res.status());
                        errors += 1;
                    }
                    Err(e) => {
                        eprintln!("Request {} failed: {}", i, e);
                        errors += 1;
                    }
                }
            }

            println!("Error count:   {}", errors);
            println!("Success count: {}", count - errors);
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: clammit returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
