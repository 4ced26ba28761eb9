use std::fs::read_to_string;

use clap::{arg, ArgMatches, Command};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, CellAlignment, Color as TColor, ContentArrangement, Table};
use eyre::{eyre, Result, WrapErr};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pp_reader_dashboard::config::{CliConfig, APP_NAME, CONFIG_NAME};
use pp_reader_dashboard::format::{format_currency, format_percent};
use pp_reader_dashboard::transport::{Fixture, FixtureTransport, PANEL_COMPONENT};
use pp_reader_dashboard::DashboardHost;

fn cli() -> Command {
    Command::new("pp-reader-dashboard")
        .about("Render the pp-reader portfolio dashboard from recorded backend data")
        .arg_required_else_help(true)
        .subcommand(Command::new("config").about("Print the path to the config file"))
        .subcommand(
            Command::new("render")
                .about("Render the dashboard markup, replaying the fixture's bus events")
                .arg(
                    arg!(<FIXTURE> "JSON file with recorded responses and events")
                        .required(false)
                        .default_value(""),
                )
                .arg(arg!(--settle "Wait for flash and retry timers before printing")),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show the normalized accounts and portfolios as tables")
                .arg(
                    arg!(<FIXTURE> "JSON file with recorded responses and events")
                        .required(false)
                        .default_value(""),
                ),
        )
}

fn fixture_path(matches: &ArgMatches, cfg: &CliConfig) -> Option<String> {
    let arg = matches
        .get_one::<String>("FIXTURE")
        .filter(|f| !f.is_empty())
        .cloned();
    arg.or_else(|| Some(cfg.fixture_file.clone()).filter(|f| !f.is_empty()))
}

fn load_fixture(path: &str) -> Result<Fixture> {
    let raw = read_to_string(path).wrap_err_with(|| format!("reading fixture {path}"))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("parsing fixture {path}"))
}

/// Home Assistant state as seen by the panel: one registered pp-reader panel.
fn hass_for(entry_id: &str) -> Value {
    json!({
        "panels": {
            "ppreader": {
                "config": {
                    "_panel_custom": {
                        "name": PANEL_COMPONENT,
                        "config": { "entry_id": entry_id }
                    }
                }
            }
        }
    })
}

async fn rendered_host(fixture: &Fixture, cfg: &CliConfig) -> Result<DashboardHost<FixtureTransport>> {
    let mut host = DashboardHost::new(FixtureTransport::from_fixture(fixture), cfg.dashboard.clone());
    host.set_hass(hass_for(&fixture.entry_id));
    host.render().await?;
    Ok(host)
}

async fn render(fixture: &Fixture, cfg: &CliConfig, settle: bool) -> Result<String> {
    let mut host = rendered_host(fixture, cfg).await?;
    for uuid in &fixture.expand {
        if !host.toggle_portfolio(uuid).await {
            return Err(eyre!("portfolio {uuid} is not part of the dashboard"));
        }
    }
    for event in &fixture.events {
        host.handle_bus_event(event);
    }
    info!(events = fixture.events.len(), "bus events replayed");
    if settle {
        host.run_timers().await;
    }
    Ok(host.to_html())
}

fn signed_cell(text: String, value: Option<f64>) -> Cell {
    let cell = Cell::new(text).set_alignment(CellAlignment::Right);
    match value {
        Some(v) if v > 0.0 => cell.fg(TColor::Green),
        Some(v) if v < 0.0 => cell.fg(TColor::Red),
        _ => cell,
    }
}

fn table_with_header(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

fn or_dash(value: Option<f64>, format: fn(f64) -> String) -> String {
    value.map(format).unwrap_or_else(|| "-".to_string())
}

async fn inspect(fixture: &Fixture, cfg: &CliConfig) -> Result<()> {
    let host = rendered_host(fixture, cfg).await?;
    let snapshot = &host.stores().caches.snapshot;

    let mut accounts = table_with_header(&["Name", "Currency", "Balance", "Original"]);
    for account in snapshot.accounts() {
        accounts.add_row(vec![
            Cell::new(&account.name),
            Cell::new(&account.currency_code),
            Cell::new(or_dash(account.balance, format_currency)).set_alignment(CellAlignment::Right),
            Cell::new(or_dash(account.orig_balance, |v| format!("{v:.2}")))
                .set_alignment(CellAlignment::Right),
        ]);
    }

    let mut portfolios = table_with_header(&["Name", "Positions", "Value", "Purchase", "Gain", "%Gain"]);
    for portfolio in snapshot.portfolios() {
        portfolios.add_row(vec![
            Cell::new(&portfolio.name),
            Cell::new(portfolio.position_count).set_alignment(CellAlignment::Right),
            Cell::new(or_dash(portfolio.current_value, format_currency))
                .set_alignment(CellAlignment::Right),
            Cell::new(or_dash(portfolio.purchase_sum, format_currency))
                .set_alignment(CellAlignment::Right),
            signed_cell(or_dash(portfolio.gain_abs, format_currency), portfolio.gain_abs),
            signed_cell(or_dash(portfolio.gain_pct, format_percent), portfolio.gain_pct),
        ]);
    }

    println!("{accounts}");
    println!("{portfolios}");
    println!(
        "{} {}",
        "Gesamtvermögen:".bold(),
        format_currency(snapshot.total_wealth()).as_str().bold()
    );
    if let Some(updated) = snapshot.last_file_update() {
        println!("{} {}", "Letzte Aktualisierung:".dimmed(), updated);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg: CliConfig = confy::load(APP_NAME, CONFIG_NAME).wrap_err("loading config")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("config", _)) => {
            let path = confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)?;
            println!("Your config file is located here: \n{}", path.display());
        }
        Some((name @ ("render" | "inspect"), sub)) => {
            let Some(path) = fixture_path(sub, &cfg) else {
                cli().print_help()?;
                return Ok(());
            };
            let fixture = load_fixture(&path)?;
            if name == "render" {
                println!("{}", render(&fixture, &cfg, sub.get_flag("settle")).await?);
            } else {
                inspect(&fixture, &cfg).await?;
            }
        }
        _ => (),
    }
    Ok(())
}
