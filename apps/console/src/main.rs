use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args as ClapArgs, Parser, Subcommand};
use client_core::{
    dashboard::load_dashboard, endpoint::DEFAULT_PORT, reconcile::format_clock, BindingPhase,
    BindingSnapshot, ChannelStatus, ConsoleError, DashboardView, DispatchError, ErrorCategory,
    FeedSnapshot, KioskClient,
};
use shared::domain::{CardTag, Student, StudentForm};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(name = "kiosk-console", about = "Operator console for the attendance kiosk")]
struct Args {
    /// Base URL of the kiosk service, e.g. http://192.168.43.41:5000.
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered students.
    Students,
    /// Register a new student. The card is bound later from `bind`.
    Register(RegisterArgs),
    /// Today's attendance with absentees.
    Dashboard {
        /// Keep refreshing until interrupted.
        #[arg(long)]
        watch: bool,
    },
    /// List cards not yet bound to a student.
    Cards,
    /// Interactive card binding session.
    Bind,
    /// Follow attendance as it is marked.
    Monitor,
}

#[derive(ClapArgs, Debug)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    roll_no: String,
    /// Date of birth as YYYY-MM-DD.
    #[arg(long)]
    dob: String,
    #[arg(long)]
    blood_group: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    dept: String,
    #[arg(long)]
    batch: String,
}

impl From<RegisterArgs> for StudentForm {
    fn from(args: RegisterArgs) -> Self {
        StudentForm {
            name: args.name,
            roll_no: args.roll_no,
            date_of_birth: args.dob,
            blood_group: args.blood_group,
            phone: args.phone,
            department: args.dept,
            batch: args.batch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings();
    settings.override_server(args.server_url, args.host, args.port)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let endpoint = settings.endpoint()?;
    info!(%endpoint, "using kiosk service");
    let client = KioskClient::new(endpoint, settings.reconnect.policy())
        .context("Failed to set up the http client")?;

    match args.command {
        Command::Students => {
            let students = client
                .api()
                .list_students()
                .await
                .context("Failed to fetch students")?;
            print_students(&students);
        }
        Command::Register(register) => {
            let form = StudentForm::from(register);
            let student = client.register(&form).await?;
            println!("Student added successfully (id {})", student.id.0);
            print_students(std::slice::from_ref(&student));
        }
        Command::Dashboard { watch: false } => {
            let view = load_dashboard(client.api().as_ref())
                .await
                .context("Failed to fetch dashboard data")?;
            print_dashboard(&view);
        }
        Command::Dashboard { watch: true } => {
            watch_dashboard(&client, settings.refresh_interval()).await?;
        }
        Command::Cards => {
            let cards = client
                .api()
                .unassigned_cards()
                .await
                .context("Failed to fetch unassigned cards")?;
            print_cards(&cards);
        }
        Command::Bind => run_bind(&client).await?,
        Command::Monitor => run_monitor(&client).await?,
    }

    Ok(())
}

fn print_students(students: &[Student]) {
    if students.is_empty() {
        println!("No students registered.");
        return;
    }
    println!(
        "{:<6} {:<10} {:<20} {:<15} {:<10} {:<6} {}",
        "ID", "ROLL NO", "NAME", "DEPT", "BATCH", "BLOOD", "CARD"
    );
    for student in students {
        println!(
            "{:<6} {:<10} {:<20} {:<15} {:<10} {:<6} {}",
            student.id.0,
            student.roll_no,
            student.name,
            student.department,
            student.batch,
            student.blood_group,
            student.card_id.as_ref().map_or("-", CardTag::as_str),
        );
    }
}

fn print_cards(cards: &[CardTag]) {
    if cards.is_empty() {
        println!("No unassigned cards.");
        return;
    }
    for card in cards {
        println!("{card}");
    }
}

fn print_dashboard(view: &DashboardView) {
    let summary = view.summary;
    println!(
        "Total students: {}  Present today: {}  Attendance rate: {}%",
        summary.total_students, summary.present_today, summary.rate_percent
    );
    println!(
        "{:<4} {:<10} {:<20} {:<15} {:<9} {}",
        "#", "ROLL NO", "NAME", "DEPT", "TIME", "STATUS"
    );
    for row in &view.rows {
        println!(
            "{:<4} {:<10} {:<20} {:<15} {:<9} {}",
            row.seq,
            row.roll_no.as_deref().unwrap_or("-"),
            row.name,
            row.department.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
            row.timestamp.display_in(&Local),
            row.status,
        );
    }
    println!(
        "Last updated {}",
        format_clock(&view.refreshed_at.with_timezone(&Local))
    );
}

async fn watch_dashboard(client: &KioskClient, every: std::time::Duration) -> Result<()> {
    let poller = client.mount_dashboard(every);
    let mut updates = WatchStream::new(poller.watch());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(snapshot) = updates.next() => {
                if snapshot.refreshes == 0 {
                    continue;
                }
                if let Some(view) = &snapshot.view {
                    print_dashboard(view);
                }
                if let Some(err) = &snapshot.error {
                    println!("! {err}");
                }
            }
        }
    }
    Ok(())
}

async fn run_monitor(client: &KioskClient) -> Result<()> {
    let (channel, monitor) = client.mount_monitor();
    let mut feed = WatchStream::new(monitor.watch());
    let mut status = WatchStream::new(channel.status());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    println!("Waiting for attendance events (Ctrl+C to stop)...");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(snapshot) = feed.next() => print_feed(&snapshot),
            Some(current) = status.next() => {
                if current == ChannelStatus::Closed {
                    let err = ConsoleError::new(
                        ErrorCategory::Channel,
                        "Live channel closed after repeated connection failures",
                    );
                    warn!(%err, "monitor stopping");
                    println!("! {err}");
                    break;
                }
                info!(status = ?current, "live channel status");
            }
        }
    }
    Ok(())
}

fn print_feed(snapshot: &FeedSnapshot) {
    if let Some(latest) = &snapshot.highlight {
        println!(">> {} just scanned", latest.name);
    }
    for entry in &snapshot.entries {
        println!(
            "   {:<20} {}",
            entry.name,
            format_clock(&entry.timestamp.with_timezone(&Local))
        );
    }
    println!();
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Select(CardTag),
    Verify,
    Start,
    Capture,
    Stop,
    Cards,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let command = match word.to_ascii_lowercase().as_str() {
        "select" => {
            let raw = words.collect::<Vec<_>>().join(" ");
            let card = CardTag::new(raw).ok_or("usage: select <card>")?;
            ReplCommand::Select(card)
        }
        "verify" => ReplCommand::Verify,
        "start" => ReplCommand::Start,
        "capture" => ReplCommand::Capture,
        "stop" => ReplCommand::Stop,
        "cards" => ReplCommand::Cards,
        "status" => ReplCommand::Status,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => return Err(format!("unknown command {other:?}; try help")),
    };
    Ok(Some(command))
}

const BIND_HELP: &str = "commands: select <card> | verify | start | capture | stop | cards | status | quit";

async fn run_bind(client: &KioskClient) -> Result<()> {
    let (_channel, controller) = client.mount_binding();
    let mut updates = WatchStream::new(controller.watch());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_seen: Option<(BindingPhase, Option<ConsoleError>, Option<String>)> = None;

    println!("{BIND_HELP}");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read command")? else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(usage) => {
                        println!("{usage}");
                        continue;
                    }
                };
                let outcome = match command {
                    ReplCommand::Select(card) => controller.select_card(card).await,
                    ReplCommand::Verify => controller.verify().await,
                    ReplCommand::Start => controller.start_camera().await,
                    ReplCommand::Capture => controller.capture_image().await,
                    ReplCommand::Stop => controller.stop_camera().await,
                    ReplCommand::Cards => {
                        let outcome = controller.refresh_pool().await;
                        print_cards(&controller.snapshot().pool);
                        outcome
                    }
                    ReplCommand::Status => {
                        print_binding(&controller.snapshot());
                        Ok(())
                    }
                    ReplCommand::Help => {
                        println!("{BIND_HELP}");
                        Ok(())
                    }
                    ReplCommand::Quit => break,
                };
                match outcome {
                    Ok(()) => {}
                    Err(DispatchError::Rejected(rejected)) => println!("! {rejected}"),
                    Err(DispatchError::Stopped) => break,
                }
            }
            Some(snapshot) = updates.next() => {
                let seen = (snapshot.phase, snapshot.error.clone(), snapshot.notice.clone());
                if last_seen.as_ref() != Some(&seen) {
                    print_binding(&snapshot);
                    last_seen = Some(seen);
                }
            }
        }
    }

    // The controller's own stop request would be abandoned with it.
    if controller.snapshot().phase.has_camera_session() {
        if let Err(err) = client.api().stop_camera().await {
            warn!(%err, "failed to stop camera on exit");
        }
    }
    Ok(())
}

fn print_binding(snapshot: &BindingSnapshot) {
    let card = snapshot.selected.as_ref().map_or("-", CardTag::as_str);
    println!("[{:?}] card: {card}", snapshot.phase);
    match &snapshot.student {
        Some(student) => println!(
            "    student: {} ({}), {} {}",
            student.name, student.roll_no, student.department, student.batch
        ),
        None if snapshot.selected.is_some() => println!("    student: not bound yet"),
        None => {}
    }
    if let Some(frame) = &snapshot.preview {
        match frame.decode() {
            Ok(bytes) => println!("    preview: {} bytes", bytes.len()),
            Err(err) => println!("    preview: undecodable frame ({err})"),
        }
    }
    if let Some(notice) = &snapshot.notice {
        println!("    {notice}");
    }
    if let Some(err) = &snapshot.error {
        println!("  ! {err}");
    }
}
