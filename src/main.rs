use clap::{Arg, ArgMatches, Command};
use log::info;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use netgeo::{
    Config, EnrichmentPipeline, NetGeoError, ReportMode, Result,
    network::{system_connection_source, GeoClient, ProcfsProcessResolver},
    network::geo::Coordinates,
    pipeline::map_points,
    report::{render_map_svg, render_summary_table, render_table, TableOptions},
    utils::format_timestamp,
};

const DEFAULT_CONFIG: &str = "config/netgeo.json";

fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG)
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .value_name("N")
                .help("Maximum concurrent enrichment tasks")
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Geolocation request timeout in milliseconds")
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("netgeo")
        .version("0.1.0")
        .about("Active connections enriched with process and geolocation details")
        .subcommand(common_args(
            Command::new("table")
                .about("Print a table of active connections sorted by process name")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .value_name("PATH")
                        .help("Also write the report as JSON")
                )
        ))
        .subcommand(common_args(
            Command::new("map")
                .about("Render connection geography as an SVG arc map")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("SVG output path")
                )
                .arg(
                    Arg::new("home")
                        .long("home")
                        .value_name("LAT,LON")
                        .help("Map center coordinates")
                )
        ))
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration to a file")
                .arg(
                    Arg::new("path")
                        .value_name("PATH")
                        .default_value(DEFAULT_CONFIG)
                )
        )
        .get_matches();

    match matches.subcommand() {
        Some(("table", sub_matches)) => {
            let config = load_config(sub_matches)?;
            init_logging(&config);
            let json_path = sub_matches.get_one::<String>("json");

            run_table_mode(&config, json_path).await?;
        }
        Some(("map", sub_matches)) => {
            let config = load_config(sub_matches)?;
            init_logging(&config);

            let home = match sub_matches.get_one::<String>("home") {
                Some(home) => Coordinates::parse(home)
                    .ok_or_else(|| NetGeoError::Parse(format!("Invalid home coordinates: {}", home)))?,
                None => {
                    let (lat, lon) = config.report.home_location;
                    Coordinates::new(lat, lon)
                        .ok_or_else(|| NetGeoError::Parse(format!("Invalid home_location: {},{}", lat, lon)))?
                }
            };
            let output = sub_matches
                .get_one::<String>("output")
                .cloned()
                .unwrap_or_else(|| config.report.map_output.clone());

            run_map_mode(&config, home, &output).await?;
        }
        Some(("init-config", sub_matches)) => {
            let path = sub_matches
                .get_one::<String>("path")
                .map(String::as_str)
                .unwrap_or(DEFAULT_CONFIG);
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Config::default().to_file(path)?;
            println!("Wrote default configuration to {}", path);
        }
        _ => {
            eprintln!("No subcommand provided. Use --help for usage information.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG);

    let mut config = if Path::new(config_path).exists() {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    if let Some(concurrency) = matches.get_one::<String>("concurrency") {
        config.pipeline.concurrency = concurrency
            .parse()
            .map_err(|_| NetGeoError::Parse(format!("Invalid concurrency: {}", concurrency)))?;
    }
    if let Some(timeout) = matches.get_one::<String>("timeout") {
        config.geolocation.timeout_ms = timeout
            .parse()
            .map_err(|_| NetGeoError::Parse(format!("Invalid timeout: {}", timeout)))?;
    }

    Ok(config)
}

fn init_logging(config: &Config) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
}

fn build_pipeline(config: &Config) -> Result<EnrichmentPipeline> {
    let source = system_connection_source(&config.pipeline.procfs_root)?;
    let resolver = ProcfsProcessResolver::new(&config.pipeline.procfs_root);
    let geo = GeoClient::from_config(&config.geolocation)?;

    Ok(EnrichmentPipeline::new(
        source,
        Arc::new(resolver),
        Arc::new(geo),
        config.pipeline.concurrency,
    ))
}

fn progress_line(done: usize, total: usize) {
    eprint!("\rProcessing Connections: {}/{}", done, total);
    if done == total {
        eprintln!();
    }
    let _ = std::io::stderr().flush();
}

async fn run_table_mode(config: &Config, json_path: Option<&String>) -> Result<()> {
    info!("Starting table mode");

    let pipeline = build_pipeline(config)?;
    let report = pipeline.run(ReportMode::Table, Some(&progress_line)).await?;

    let options = TableOptions {
        include_hostname: config.report.include_hostname,
        include_readme: config.report.include_readme,
    };

    println!("Active Connections Details ({}):", format_timestamp(report.generated_at));
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    render_table(&mut out, &report.rows, options)?;
    out.flush()?;

    if let Some(path) = json_path {
        let json_output = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json_output)?;
        info!("Report {} saved to: {}", report.run_id, path);
    }

    Ok(())
}

async fn run_map_mode(config: &Config, home: Coordinates, output: &str) -> Result<()> {
    info!("Starting map mode centered on {}", home);

    let pipeline = build_pipeline(config)?;
    let report = pipeline.run(ReportMode::Map, Some(&progress_line)).await?;

    println!("Active Connections ({}):", format_timestamp(report.generated_at));
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    render_summary_table(&mut out, &report.rows)?;
    out.flush()?;
    drop(out);

    let points = map_points(&report.map_rows(), home);
    for point in &points {
        info!(
            "{} ({}): {} connection(s), {:.0} km",
            point.label, point.coordinates, point.connections, point.distance_km
        );
    }

    std::fs::write(output, render_map_svg(home, &points))?;
    println!("Map with {} location(s) written to {}", points.len(), output);

    Ok(())
}
