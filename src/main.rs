mod cache;
mod certificate;
mod config;
mod document;
mod error;
mod groepsadmin;
mod logging;
mod models;
mod pricing;
mod sheets;
mod utils;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use cache::MemberCache;
use certificate::{plan_certificates, RunPlan, SerialCounter};
use config::{UserConfig, DEFAULT_CONFIG_FILE};
use document::{
    certificate_fields, generate_template_file, organisation_fields, unique_certificate_path, DocxTemplate, PdfExporter,
};
use groepsadmin::GroepsadminClient;
use models::MemberRecord;
use sheets::{ActivityCatalog, PresenceSheet};
use utils::{format_euro, mask_token, truncate_string, Timer};

const CACHE_MAX_AGE_HOURS: i64 = 24;

#[derive(Parser)]
#[command(name = "taxcert", version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Tax certificates for youth movement activities", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a daily rotated file in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the tax certificates of every present member
    Generate {
        /// Show the planned certificates without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Resolve members from the local cache instead of Groepsadmin
        #[arg(long)]
        offline: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pdf)]
        format: OutputFormat,

        /// Keep the intermediate .docx files next to the PDFs
        #[arg(long)]
        keep_docx: bool,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Fill in the organisation details of the template
    Template,
    /// Check the Groepsadmin credentials
    Login,
    /// Show or clear the member cache
    Cache {
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Pdf,
    Docx,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.log_file {
        if let Err(e) = logging::init_with_file("taxcert.log", cli.verbose) {
            eprintln!("Warning: could not open log file: {}", e);
            logging::init(cli.verbose);
        }
    } else {
        logging::init(cli.verbose);
    }

    match run(cli).await {
        Ok(_) => (),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = UserConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    tracing::debug!(
        "Loaded configuration for {} ({})",
        config.organisation.general_info.name,
        config.calendar_year()
    );

    match cli.command {
        Commands::Generate { dry_run, offline, format, keep_docx, yes } => {
            let options = GenerateOptions { dry_run, offline, format, keep_docx, yes };
            handle_generate(config, &cli.config, options).await
        }
        Commands::Template => handle_template(&config, &cli.config),
        Commands::Login => handle_login(&config).await,
        Commands::Cache { clear } => handle_cache(&config, &cli.config, clear),
    }
}

struct GenerateOptions {
    dry_run: bool,
    offline: bool,
    format: OutputFormat,
    keep_docx: bool,
    yes: bool,
}

/// Relative paths in the configuration are relative to the file itself.
fn resolve(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn cache_path(config: &UserConfig, config_path: &Path) -> Result<PathBuf> {
    Ok(resolve(config_path, &config.cache_path()?))
}

async fn handle_generate(mut config: UserConfig, config_path: &Path, options: GenerateOptions) -> Result<()> {
    let timer = Timer::new("Generating tax certificates");

    // A. organisation-level template
    let template_path = resolve(config_path, &config.tax_certificate.template_file_name);
    let template = if options.dry_run {
        DocxTemplate::open(&template_path)?.fill(&organisation_fields(&config.certificate_template()))?
    } else {
        let (path, template) = generate_template_file(&template_path, &config.certificate_template())?;
        println!("Template: {}", path.display());
        template
    };

    // B. spreadsheets and member records
    let catalog = ActivityCatalog::from_path(&resolve(config_path, &config.sources.activities_sheet))
        .context("Failed to read the activity sheet")?;
    let presence = PresenceSheet::from_path(&resolve(config_path, &config.sources.presence_sheet))
        .context("Failed to read the presence sheet")?;
    println!(
        "Loaded {} activities and {} present members",
        catalog.activity_count(),
        presence.len()
    );
    for group in &config.organisation.age_groups {
        let name = group.name.to_lowercase();
        if !catalog.age_groups().any(|known| known == name) {
            tracing::warn!("Age group '{}' has no rows in the activity sheet", group.name);
        }
    }
    if presence.is_empty() {
        println!("Nobody attended an activity, nothing to generate.");
        return Ok(());
    }

    let records = resolve_members(&config, config_path, &presence, options.offline).await?;

    // C. plan, then write one document per member
    let plan = plan_certificates(&config, &presence, &catalog, &records);
    let mut counter = SerialCounter::from_config(&config);

    if options.dry_run {
        print_plan(&plan, counter.peek()?);
        print_skipped(&plan);
        println!("\nDry run: nothing was written.");
        return Ok(());
    }

    if plan.drafts.is_empty() {
        print_skipped(&plan);
        println!("\nNo certificates to generate.");
        return Ok(());
    }

    if !options.yes {
        println!(
            "\nReady to generate {} certificate(s) starting at serial {}",
            plan.drafts.len(),
            counter.peek()?
        );
        println!("Do you want to proceed? (y/N)");

        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim().to_lowercase() != "y" {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let output_dir = resolve(config_path, &config.tax_certificate.output_dir);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let exporter = PdfExporter::new(&config.export.converter, options.keep_docx || config.export.keep_docx);

    let planned = plan.drafts.len();
    let mut failures: Vec<(String, String)> = Vec::new();
    let mut taken = HashSet::new();
    for draft in plan.drafts.iter().cloned() {
        let name = draft.full_name();
        let serial = match counter.peek() {
            Ok(serial) => serial,
            Err(e) => {
                failures.push((name, e.to_string()));
                break;
            }
        };

        let certificate = draft.into_certificate(serial);
        let docx = unique_certificate_path(&output_dir, &name, serial, "docx", &mut taken);
        let written = template
            .fill(&certificate_fields(&certificate))
            .and_then(|filled| {
                let leftover = filled.placeholders();
                if !leftover.is_empty() {
                    tracing::warn!("{}: unfilled placeholders {}", name, leftover.join(", "));
                }
                filled.save(&docx)
            })
            .and_then(|_| match options.format {
                OutputFormat::Pdf => exporter.export(&docx),
                OutputFormat::Docx => Ok(docx.clone()),
            });

        match written {
            Ok(path) => {
                counter.advance()?;
                tracing::info!(member = %name, serial, "Certificate written");
                println!("  {}  {}  {}", serial, name, path.display());
            }
            Err(e) => {
                tracing::error!("Failed to generate the certificate of {}: {}", name, e);
                failures.push((name, e.to_string()));
            }
        }
    }

    // D. persist the next free serial number
    if counter.issued() > 0 {
        config.record_issued(counter.issued());
        config
            .save(config_path)
            .with_context(|| format!("Failed to save next serial number to {}", config_path.display()))?;
    }

    print_skipped(&plan);
    println!(
        "\nGenerated {} of {} planned certificates ({} members skipped)",
        counter.issued(),
        planned,
        plan.skipped.len()
    );
    if let Some((first, last)) = counter.range() {
        println!("Serial numbers {} to {}", first, last);
    }
    println!("{}", timer.stop_with_message());

    if !failures.is_empty() {
        eprintln!("\nFailed certificates:");
        for (name, reason) in &failures {
            eprintln!("  {}: {}", name, reason);
        }
        return Err(anyhow!("{} certificate(s) could not be generated", failures.len()));
    }
    Ok(())
}

async fn resolve_members(
    config: &UserConfig,
    config_path: &Path,
    presence: &PresenceSheet,
    offline: bool,
) -> Result<Vec<MemberRecord>> {
    let mut cache = MemberCache::load(&cache_path(config, config_path)?)?;

    if offline {
        if cache.is_empty() {
            return Err(anyhow!(
                "The member cache at {} is empty, run once without --offline",
                cache.path().display()
            ));
        }
        if cache.is_stale(CACHE_MAX_AGE_HOURS) {
            tracing::warn!("Member cache was last updated {}, it may be outdated", cache.last_updated);
        }
        let records: Vec<MemberRecord> = presence
            .entries
            .iter()
            .filter_map(|entry| cache.get_by_name(&entry.name))
            .cloned()
            .collect();
        println!("Found {} of {} members in the cache", records.len(), presence.len());
        return Ok(records);
    }

    let (username, password) = config.prompt_for_credentials()?;
    let mut client = GroepsadminClient::new(&config.groepsadmin)?;
    client
        .login(&username, &password)
        .await
        .context("Failed to log in to Groepsadmin")?;

    let records = client.fetch_directory(&presence.names()).await?;
    println!("Fetched {} members from Groepsadmin", records.len());

    cache.update_from_records(&records);
    if let Err(e) = cache.save() {
        tracing::warn!("Could not update the member cache: {}", e);
    }
    Ok(records)
}

fn print_plan(plan: &RunPlan, first_serial: u32) {
    println!("\nPlanned certificates:");
    for (serial, draft) in (first_serial..).zip(&plan.drafts) {
        println!(
            "\n{}  {} ({})",
            serial,
            draft.full_name(),
            draft.age_group
        );
        for item in &draft.activities.items {
            println!(
                "    {:<20} {:>3} days  {:>10}  {}",
                truncate_string(&item.name, 20),
                item.activity.number_of_days,
                format_euro(item.activity.total_price),
                item.rule
            );
        }
        println!("    {:<20} {:>20}", "Total", format_euro(draft.activities.total));
    }
}

fn print_skipped(plan: &RunPlan) {
    if plan.skipped.is_empty() {
        return;
    }
    println!("\nSkipped members:");
    for (name, reason) in &plan.skipped {
        println!("  {}: {}", name, reason);
    }
}

fn handle_template(config: &UserConfig, config_path: &Path) -> Result<()> {
    let template_path = resolve(config_path, &config.tax_certificate.template_file_name);
    let (path, template) = generate_template_file(&template_path, &config.certificate_template())?;

    println!("Template written to {}", path.display());
    let placeholders = template.placeholders();
    if !placeholders.is_empty() {
        println!("Placeholders filled per member: {}", placeholders.join(", "));
    }
    Ok(())
}

async fn handle_login(config: &UserConfig) -> Result<()> {
    let (username, password) = config.prompt_for_credentials()?;
    let mut client = GroepsadminClient::new(&config.groepsadmin)?;

    println!("Testing connection to Groepsadmin...");
    client
        .login(&username, &password)
        .await
        .context("Failed to log in to Groepsadmin")?;

    let token = client.token().map(mask_token).unwrap_or_default();
    println!("Logged in as {} (token {})", username, token);
    Ok(())
}

fn handle_cache(config: &UserConfig, config_path: &Path, clear: bool) -> Result<()> {
    let mut cache = MemberCache::load(&cache_path(config, config_path)?)?;

    if clear {
        let count = cache.len();
        cache.clear();
        cache.save()?;
        println!("Removed {} members from {}", count, cache.path().display());
        return Ok(());
    }

    println!("Member cache: {}", cache.path().display());
    println!("Last updated: {}", cache.last_updated);
    if cache.is_stale(CACHE_MAX_AGE_HOURS) {
        println!("(older than {} hours)", CACHE_MAX_AGE_HOURS);
    }
    println!("{} members", cache.len());

    for record in cache.records() {
        println!(
            "  {:<30} {}  {}",
            truncate_string(&record.member.full_name(), 30),
            record.member.date_of_birth.format("%d/%m/%Y"),
            if record.parent.is_some() { "" } else { "(no contact)" }
        );
    }
    Ok(())
}
