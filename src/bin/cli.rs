// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use clap::Parser;
use loan_liberator::logging::init_logging;
use loan_liberator::{select_titles, CatalogClient, Config, ConfigOverrides, Liberator, SelectionRequest};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "loan-liberator")]
#[command(about = "Download borrowed library titles as EPUB, CBZ or M4B", long_about = None)]
struct Cli {
    /// Library account username
    #[arg(long, env = "LIBERATOR_USERNAME")]
    username: Option<String>,

    /// Library account password
    #[arg(long, env = "LIBERATOR_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Title ids to download; titles not on loan are borrowed first
    #[arg(long = "title-id", num_args = 1..)]
    title_ids: Vec<i64>,

    /// Download every borrowed title
    #[arg(long)]
    all_borrowed: bool,

    /// Output folder for finished files
    #[arg(long)]
    output_folder: Option<PathBuf>,

    /// Keep decrypted data in the scratch folder
    #[arg(long)]
    keep_decrypted_data: bool,

    /// Keep encrypted data in the scratch folder
    #[arg(long)]
    keep_encrypted_data: bool,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg_bin: Option<PathBuf>,

    /// Path to an epubzip binary
    #[arg(long)]
    epub_zip_bin: Option<PathBuf>,

    /// Use an already extracted download instead of fetching
    #[arg(long)]
    use_existing_download: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Audiobook content key (KID:KEY)
    #[arg(long)]
    content_key: Option<String>,

    /// Program that prints the audiobook content key
    #[arg(long)]
    key_command: Option<String>,

    /// Extra argument for --key-command (repeatable)
    #[arg(long = "key-arg", requires = "key_command")]
    key_args: Vec<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Write JSON logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            output_root: self.output_folder.clone(),
            keep_decrypted: self.keep_decrypted_data,
            keep_encrypted: self.keep_encrypted_data,
            use_existing_download: self.use_existing_download.clone(),
            ffmpeg: self.ffmpeg_bin.clone(),
            epub_zip: self.epub_zip_bin.clone(),
            content_key: self.content_key.clone(),
            key_command: self.key_command.as_ref().map(|program| {
                std::iter::once(program.clone())
                    .chain(self.key_args.iter().cloned())
                    .collect()
            }),
            username: self.username.clone(),
            password: self.password.clone(),
            verbose: self.verbose,
            log_file: self.log_file.clone(),
        }
    }

    fn selection(&self) -> SelectionRequest {
        if self.all_borrowed {
            SelectionRequest::all_borrowed()
        } else {
            SelectionRequest::titles(self.title_ids.clone())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every selected item succeeded
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = match &cli.config_file {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.merge_overrides(cli.overrides());
    config.validate()?;

    init_logging(config.verbose, config.log_file.as_deref())?;

    let selection = cli.selection();
    if !selection.all_borrowed && selection.title_ids.is_empty() {
        bail!("nothing to do: pass --all-borrowed or --title-id");
    }

    let credentials = config
        .credentials
        .clone()
        .context("credentials required: --username/--password or [credentials] in the config file")?;

    if !config.output_root.exists() {
        tracing::info!(path = %config.output_root.display(), "creating output folder");
        std::fs::create_dir_all(&config.output_root)
            .with_context(|| format!("creating {}", config.output_root.display()))?;
    }

    let client = CatalogClient::with_config(config.client_config())?;
    let session = client
        .login(&credentials.username, &credentials.password)
        .await
        .context("login failed")?;

    let items = select_titles(&client, &session, &selection).await?;
    if items.is_empty() {
        println!("No titles to download.");
        return Ok(true);
    }

    let liberator = Liberator::new(config, Arc::new(client))?;
    let report = liberator.run_batch(&session, items).await;

    for output in &report.succeeded {
        let note = if output.fallback { " (whole tree archived)" } else { "" };
        println!("✓ {} -> {}{}", output.item.title, output.path.display(), note);
    }
    for failure in &report.failed {
        println!("✗ {}: {}", failure.item.title, failure.error.user_message());
    }
    println!("{}", report.summary());

    Ok(report.is_success())
}
