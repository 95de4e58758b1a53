use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "rollcall", about = "Hostel attendance CLI")]
struct Cli {
    /// Base URL of rollcalld
    #[arg(long, env = "ROLLCALL_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    /// Operator identity recorded on scans, finalization and face registration
    #[arg(long, env = "ROLLCALL_OPERATOR", default_value = "cli")]
    operator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a face image and mark attendance
    Scan {
        /// Path to a JPEG or PNG image
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Close today's attendance and mark remaining students absent
    Finalize,
    /// Show today's attendance state
    Status,
    /// List students still expected today
    Pending,
    /// Attendance reports
    #[command(subcommand)]
    Report(ReportCommand),
    /// Student management
    #[command(subcommand)]
    Student(StudentCommand),
}

#[derive(Subcommand)]
enum ReportCommand {
    /// Today's present and absent lists
    Today,
    /// Report for one date (YYYY-MM-DD)
    Date { date: String },
    /// Per-date totals for a month (YYYY-MM)
    Month { month: String },
    /// One student's records
    History {
        reg_no: String,
        /// Restrict to a month (YYYY-MM)
        #[arg(long)]
        month: Option<String>,
    },
}

#[derive(Subcommand)]
enum StudentCommand {
    /// Enroll a student
    Add {
        reg_no: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        room: String,
        #[arg(long)]
        dept: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        college: String,
    },
    /// List students
    List {
        /// Substring of regNo or name
        #[arg(long)]
        search: Option<String>,
        /// Only students with (true) or without (false) a registered face
        #[arg(long)]
        registered: Option<bool>,
    },
    /// Edit a student's display fields
    Update {
        reg_no: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        dept: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        college: Option<String>,
    },
    /// Enroll students from a JSON file holding an array of rows
    Import { file: PathBuf },
    /// List accepted enrollment categories
    Categories,
    /// List accepted colleges
    Colleges,
    /// Show one student
    Show { reg_no: String },
    /// Delete a student
    Remove { reg_no: String },
    /// Set leave status (none, on_leave, medical)
    Leave {
        reg_no: String,
        status: String,
        /// RFC 3339 timestamp the leave ends
        #[arg(long)]
        until: Option<String>,
    },
    /// Register a student's face from an image file
    RegisterFace {
        reg_no: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Show enrollment totals
    Count,
}

struct Client {
    http: reqwest::Client,
    base: String,
    operator: String,
}

impl Client {
    fn new(url: &str, operator: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("{}/api", url.trim_end_matches('/')),
            operator,
        }
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header("x-operator", &self.operator)
            .query(params);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.build().context("failed to build request")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let req = self.request(method, path, params, body)?;
        let url = req.url().clone();
        tracing::debug!(method = %req.method(), %url, "request");

        let resp = self
            .http
            .execute(req)
            .await
            .with_context(|| format!("could not reach rollcalld at {url}"))?;

        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = value["message"].as_str().unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(value)
    }
}

fn image_payload(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(json!({ "imageBase64": STANDARD.encode(bytes) }))
}

fn list_params(search: Option<String>, registered: Option<bool>) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(q) = search {
        params.push(("search", q));
    }
    if let Some(r) = registered {
        params.push(("faceRegistered", r.to_string()));
    }
    params
}

fn import_payload(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let rows: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if !rows.is_array() && rows.get("students").is_none() {
        bail!("{} must hold an array of student rows", path.display());
    }
    Ok(rows)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.url, cli.operator);

    let result = match cli.command {
        Commands::Scan { image } => {
            client
                .send(Method::POST, "/attendance/scan", &[], Some(image_payload(&image)?))
                .await?
        }
        Commands::Finalize => client.send(Method::POST, "/attendance/finalize", &[], None).await?,
        Commands::Status => client.send(Method::GET, "/attendance/status", &[], None).await?,
        Commands::Pending => client.send(Method::GET, "/attendance/pending", &[], None).await?,
        Commands::Report(report) => {
            let (path, params): (String, Vec<(&str, String)>) = match report {
                ReportCommand::Today => ("/attendance/today".to_string(), Vec::new()),
                ReportCommand::Date { date } => (format!("/attendance/date/{date}"), Vec::new()),
                ReportCommand::Month { month } => (format!("/attendance/month/{month}"), Vec::new()),
                ReportCommand::History { reg_no, month } => (
                    format!("/attendance/history/{reg_no}"),
                    month.map(|m| ("month", m)).into_iter().collect(),
                ),
            };
            client.send(Method::GET, &path, &params, None).await?
        }
        Commands::Student(cmd) => match cmd {
            StudentCommand::Add {
                reg_no,
                name,
                room,
                dept,
                category,
                college,
            } => {
                let body = json!({
                    "regNo": reg_no,
                    "name": name,
                    "roomNo": room,
                    "dept": dept,
                    "category": category,
                    "college": college,
                });
                client.send(Method::POST, "/students", &[], Some(body)).await?
            }
            StudentCommand::Update {
                reg_no,
                name,
                room,
                dept,
                category,
                college,
            } => {
                let body = json!({
                    "name": name,
                    "roomNo": room,
                    "dept": dept,
                    "category": category,
                    "college": college,
                });
                client
                    .send(Method::PATCH, &format!("/students/{reg_no}"), &[], Some(body))
                    .await?
            }
            StudentCommand::Import { file } => {
                client
                    .send(Method::POST, "/students/bulk", &[], Some(import_payload(&file)?))
                    .await?
            }
            StudentCommand::Categories => {
                client.send(Method::GET, "/students/categories", &[], None).await?
            }
            StudentCommand::Colleges => {
                client.send(Method::GET, "/students/colleges", &[], None).await?
            }
            StudentCommand::List { search, registered } => {
                client
                    .send(Method::GET, "/students", &list_params(search, registered), None)
                    .await?
            }
            StudentCommand::Show { reg_no } => {
                client.send(Method::GET, &format!("/students/{reg_no}"), &[], None).await?
            }
            StudentCommand::Remove { reg_no } => {
                client.send(Method::DELETE, &format!("/students/{reg_no}"), &[], None).await?
            }
            StudentCommand::Leave { reg_no, status, until } => {
                let body = json!({ "leaveStatus": status, "leaveUntil": until });
                client
                    .send(Method::PATCH, &format!("/students/{reg_no}/leave"), &[], Some(body))
                    .await?
            }
            StudentCommand::RegisterFace { reg_no, image } => {
                client
                    .send(
                        Method::POST,
                        &format!("/students/{reg_no}/face"),
                        &[],
                        Some(image_payload(&image)?),
                    )
                    .await?
            }
            StudentCommand::Count => client.send(Method::GET, "/students/count", &[], None).await?,
        },
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
