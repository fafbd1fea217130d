use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::Value;
use zbus::proxy;

#[proxy(
    interface = "org.attendance.Attendance1",
    default_service = "org.attendance.Attendance1",
    default_path = "/org/attendance/Attendance1"
)]
trait Attendance {
    fn enroll(&self, id: u32, name: &str) -> zbus::Result<String>;
    fn cancel_enroll(&self, id: u32) -> zbus::Result<bool>;
    fn mark_manual(&self, id: u32, name: &str) -> zbus::Result<String>;
    fn train(&self) -> zbus::Result<String>;
    fn start_session(&self, mode: &str) -> zbus::Result<u32>;
    fn stop_session(&self, handle: u32) -> zbus::Result<bool>;
    fn attendance(&self, date: &str) -> zbus::Result<String>;
    fn attendance_dates(&self) -> zbus::Result<String>;
    fn roster(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn enroll_progress(&self, id: u32, captured: u32, target: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn session_event(&self, handle: u32, event_json: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "attendance", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for an employee and retrain
    Enroll {
        /// Numeric employee id
        #[arg(short, long)]
        id: u32,
        /// Employee name
        #[arg(short, long)]
        name: String,
    },
    /// Retrain the recognition model from stored samples
    Train,
    /// Mark an employee present today without the camera
    Mark {
        /// Numeric employee id
        #[arg(short, long)]
        id: u32,
        /// Name to record (defaults to the roster entry)
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// Recognize faces and mark attendance (ctrl-c to stop)
    Run {
        /// Keep marking until stopped instead of stopping after the first mark
        #[arg(short, long)]
        continuous: bool,
    },
    /// Stop a running session by handle
    Stop { handle: u32 },
    /// Show today's attendance
    Today,
    /// Show attendance for a date (YYYY-MM-DD)
    Attendance { date: String },
    /// List dates with attendance records
    Dates,
    /// List enrolled employees
    Roster,
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices (does not use the daemon)
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        command => {
            let connection = if cli.system {
                zbus::Connection::system().await
            } else {
                zbus::Connection::session().await
            }
            .context("connecting to D-Bus")?;
            let proxy = AttendanceProxy::new(&connection)
                .await
                .context("attendanced is not reachable")?;
            call_daemon(&proxy, command).await?;
        }
    }

    Ok(())
}

async fn call_daemon(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Enroll { id, name } => enroll(proxy, id, &name).await?,
        Commands::Train => {
            let summary: Value = serde_json::from_str(&proxy.train().await?)?;
            println!(
                "Trained on {} samples from {} employees",
                summary["samples"], summary["employees"]
            );
        }
        Commands::Mark { id, name } => {
            let event: Value = serde_json::from_str(&proxy.mark_manual(id, &name).await?)?;
            print_event(&event);
        }
        Commands::Run { continuous } => run(proxy, continuous).await?,
        Commands::Stop { handle } => {
            if proxy.stop_session(handle).await? {
                println!("Stopping session {handle}");
            } else {
                println!("No running session {handle}");
            }
        }
        Commands::Today => print_attendance(&proxy.attendance("today").await?)?,
        Commands::Attendance { date } => print_attendance(&proxy.attendance(&date).await?)?,
        Commands::Dates => {
            let dates: Vec<String> = serde_json::from_str(&proxy.attendance_dates().await?)?;
            if dates.is_empty() {
                println!("No attendance recorded");
            }
            for date in dates {
                println!("{date}");
            }
        }
        Commands::Roster => {
            let roster: Vec<Value> = serde_json::from_str(&proxy.roster().await?)?;
            if roster.is_empty() {
                println!("No employees enrolled");
            }
            for employee in roster {
                println!("{:>6}  {}", text(&employee["id"]), text(&employee["name"]));
            }
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => list_devices(),
    }
    Ok(())
}

async fn enroll(proxy: &AttendanceProxy<'_>, id: u32, name: &str) -> Result<()> {
    let mut progress = proxy.receive_enroll_progress().await?;
    println!("Enrolling {name} (id {id}); look at the camera");

    let call = proxy.enroll(id, name);
    tokio::pin!(call);

    let mut cancelling = false;
    let summary = loop {
        tokio::select! {
            result = &mut call => break result?,
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                println!("Stopping; keeping samples captured so far");
                proxy.cancel_enroll(id).await?;
            }
            Some(signal) = progress.next() => {
                let args = signal.args()?;
                if *args.id() == id {
                    println!("  captured {}/{}", args.captured(), args.target());
                }
            }
        }
    };

    let summary: Value = serde_json::from_str(&summary)?;
    println!(
        "Enrolled {} with {} samples; model now has {} samples",
        text(&summary["name"]),
        summary["captured"],
        summary["training"]["samples"]
    );
    Ok(())
}

async fn run(proxy: &AttendanceProxy<'_>, continuous: bool) -> Result<()> {
    // Subscribe before starting so no event is missed.
    let mut events = proxy.receive_session_event().await?;
    let mode = if continuous { "continuous" } else { "single" };
    let handle = proxy.start_session(mode).await?;
    println!("Session {handle} started ({mode}); ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                proxy.stop_session(handle).await?;
            }
            signal = events.next() => {
                let Some(signal) = signal else {
                    bail!("daemon went away");
                };
                let args = signal.args()?;
                if *args.handle() != handle {
                    continue;
                }
                let event: Value = serde_json::from_str(args.event_json())?;
                print_event(&event);
                match event["event"].as_str() {
                    Some("stopped") => return Ok(()),
                    Some("failed") => bail!("session failed: {}", text(&event["error"])),
                    _ => {}
                }
            }
        }
    }
}

fn print_event(event: &Value) {
    match event["event"].as_str().unwrap_or_default() {
        "marked" => {
            let record = &event["record"];
            println!("Marked   {:>6}  {}  at {}", text(&record["employee_id"]), text(&record["name"]), text(&record["time"]));
        }
        "already_marked" => println!(
            "Already  {:>6}  {}  (first seen {})",
            text(&event["employee_id"]),
            text(&event["name"]),
            text(&event["first_marked_at"])
        ),
        "unknown" => match event["employee_id"].as_u64() {
            Some(id) => println!("Unknown  id {id} is not on the roster"),
            None => println!("Unknown  face (distance {:.1})", event["distance"].as_f64().unwrap_or_default()),
        },
        "stopped" => println!("Stopped: {}", text(&event["reason"])),
        "failed" => {}
        other => println!("{other}: {event}"),
    }
}

fn print_attendance(json: &str) -> Result<()> {
    let records: Vec<Value> = serde_json::from_str(json)?;
    if records.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }
    println!("{:>6}  {:<24}  Time", "ID", "Name");
    for r in records {
        println!("{:>6}  {:<24}  {}", text(&r["employee_id"]), text(&r["name"]), text(&r["time"]));
    }
    Ok(())
}

fn list_devices() {
    let devices = attendance_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} (driver {}, bus {})", d.path, d.name, d.driver, d.bus);
    }
}

/// Render a JSON string without quotes; other values as JSON.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enroll_and_run() {
        let cli = Cli::try_parse_from(["attendance", "enroll", "--id", "7", "--name", "Alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Enroll { id: 7, ref name } if name == "Alice"));

        let cli = Cli::try_parse_from(["attendance", "--system", "run", "--continuous"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Run { continuous: true }));

        assert!(Cli::try_parse_from(["attendance", "enroll", "--id", "seven", "--name", "Alice"]).is_err());
    }

    #[test]
    fn test_parse_mark() {
        let cli = Cli::try_parse_from(["attendance", "mark", "--id", "4"]).unwrap();
        assert!(matches!(cli.command, Commands::Mark { id: 4, ref name } if name.is_empty()));

        let cli = Cli::try_parse_from(["attendance", "mark", "-i", "8", "-n", "Hal"]).unwrap();
        assert!(matches!(cli.command, Commands::Mark { id: 8, ref name } if name == "Hal"));
    }

    #[test]
    fn test_text_strips_quotes() {
        assert_eq!(text(&serde_json::json!("Alice")), "Alice");
        assert_eq!(text(&serde_json::json!(7)), "7");
    }
}
