use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use trustroute_agents::{load_policy_document, NoCompletion, RefundAssistant};
use trustroute_core::{
    calculate_refund, default_operators, ChatInput, ChatMessage, ChatRole, RefundRules,
    RefundStatus,
};
use trustroute_observability::{init_tracing, AppMetrics};
use trustroute_storage::{
    seed_default_operators, BookingRepository, OperatorRepository, Store, UserRepository,
};

#[derive(Debug, Parser)]
#[command(name = "trustroute")]
#[command(about = "TrustRoute refund tooling")]
struct Cli {
    /// SQLite URL such as `sqlite://trustroute.db`; in-memory when unset.
    #[arg(long, env = "TRUSTROUTE_DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute a refund without touching any booking.
    Quote {
        #[arg(long)]
        amount: f64,
        /// Departure instant (RFC 3339).
        #[arg(long, conflicts_with = "hours")]
        departure: Option<DateTime<Utc>>,
        /// Hours remaining before departure; may be negative.
        #[arg(long, allow_hyphen_values = true)]
        hours: Option<f64>,
        /// Use a seed operator's slabs instead of the standard policy.
        #[arg(long, conflicts_with = "policy")]
        operator: Option<String>,
        /// Path to a policy JSON document (`{"slabs": [...], "fees": {...}}`).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Insert the default operators and their policies when missing.
    Seed,
    /// List operators with their current policy.
    Operators,
    /// Move a refund to PROCESSING, COMPLETED or FAILED.
    RefundStatus {
        #[arg(long)]
        booking: String,
        #[arg(long, value_parser = parse_refund_status)]
        status: RefundStatus,
    },
    /// Talk to the refund assistant as an existing user.
    Chat {
        #[arg(long)]
        email: String,
        #[arg(long, env = "TRUSTROUTE_POLICY_DOC")]
        policy_doc: Option<PathBuf>,
        #[arg(long)]
        locale: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("trustroute_cli");
    let cli = Cli::parse();

    match cli.command {
        Command::Quote {
            amount,
            departure,
            hours,
            operator,
            policy,
        } => {
            let now = Utc::now();
            let departure = quote_departure(now, departure, hours)?;
            let rules = quote_rules(operator.as_deref(), policy.as_deref())?;
            let result = calculate_refund(amount, departure, now, &rules)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Seed => {
            let store = open_store(cli.database_url.as_deref()).await?;
            let inserted = seed_default_operators(&store).await?;
            println!("seeded {inserted} operator(s) into {} store", store.backend());
        }
        Command::Operators => {
            let store = open_store(cli.database_url.as_deref()).await?;
            let operators = store.list_operators().await?;
            if operators.is_empty() {
                eprintln!("no operators yet; run `trustroute seed` first");
            }
            println!("{}", serde_json::to_string_pretty(&operators)?);
        }
        Command::RefundStatus { booking, status } => {
            let store = open_store(cli.database_url.as_deref()).await?;
            let refund = store
                .update_refund_status(&booking, status, Utc::now())
                .await
                .with_context(|| format!("failed to move refund for booking {booking} to {status}"))?;
            println!("{}", serde_json::to_string_pretty(&refund)?);
        }
        Command::Chat {
            email,
            policy_doc,
            locale,
        } => {
            let store = Arc::new(open_store(cli.database_url.as_deref()).await?);
            let user = store
                .find_user_by_email(email.trim())
                .await?
                .with_context(|| format!("no user registered as {email}"))?;
            let assistant = RefundAssistant::new(
                store,
                AppMetrics::shared(),
                load_policy_document(policy_doc.as_deref()),
            );
            run_chat(&assistant, &user, locale).await?;
        }
    }

    Ok(())
}

async fn open_store(database_url: Option<&str>) -> Result<Store> {
    Store::from_url(database_url)
        .await
        .context("failed to open store")
}

fn quote_departure(
    now: DateTime<Utc>,
    departure: Option<DateTime<Utc>>,
    hours: Option<f64>,
) -> Result<DateTime<Utc>> {
    let hours = match (departure, hours) {
        (Some(departure), _) => return Ok(departure),
        (None, Some(hours)) => hours,
        (None, None) => bail!("pass --departure or --hours"),
    };
    if !hours.is_finite() {
        bail!("--hours must be a finite number (got {hours})");
    }

    // `as` saturates, so out-of-range values are caught by `try_seconds`.
    let offset = Duration::try_seconds((hours * 3600.0).round() as i64)
        .with_context(|| format!("--hours {hours} is out of range"))?;
    now.checked_add_signed(offset)
        .with_context(|| format!("--hours {hours} is out of range"))
}

fn quote_rules(operator: Option<&str>, policy: Option<&Path>) -> Result<RefundRules> {
    if let Some(path) = policy {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading policy from {}", path.display()))?;
        return RefundRules::from_json_str(&raw)
            .with_context(|| format!("invalid policy in {}", path.display()));
    }

    match operator {
        Some(name) => default_operators()
            .into_iter()
            .find(|seed| seed.name.eq_ignore_ascii_case(name.trim()))
            .map(|seed| seed.rules)
            .with_context(|| format!("unknown operator {name}")),
        None => Ok(RefundRules::standard()),
    }
}

fn parse_refund_status(value: &str) -> Result<RefundStatus, String> {
    RefundStatus::parse(value).ok_or_else(|| {
        format!("unknown status {value}; expected processing, completed or failed")
    })
}

async fn run_chat(
    assistant: &RefundAssistant<Store>,
    user: &trustroute_core::User,
    locale: Option<String>,
) -> Result<()> {
    let mut session_id: Option<String> = None;
    let mut messages: Vec<ChatMessage> = Vec::new();

    println!("TrustRoute assistant. type 'exit' to quit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let message = line.trim();
        if message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit") {
            break;
        }
        if message.is_empty() {
            continue;
        }

        messages.push(ChatMessage {
            role: ChatRole::User,
            content: message.to_string(),
        });
        let reply = assistant
            .handle_chat(
                ChatInput {
                    session_id: session_id.clone(),
                    user_id: user.user_id.clone(),
                    messages: messages.clone(),
                    locale: locale.clone(),
                },
                user,
                &NoCompletion,
            )
            .await?;

        if let Some(id) = reply
            .json_payload
            .get("session_id")
            .and_then(|value| value.as_str())
        {
            session_id = Some(id.to_string());
        }
        messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: reply.reply_text.clone(),
        });

        println!("\n{}\n", reply.reply_text);

        if !reply.clarifying_questions.is_empty() {
            println!("Clarifying questions:");
            for question in reply.clarifying_questions {
                println!("- {question}");
            }
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_defaults_to_the_standard_policy() {
        let rules = quote_rules(None, None).unwrap();
        assert_eq!(rules, RefundRules::standard());
    }

    #[test]
    fn quote_finds_seed_operators_by_name() {
        let rules = quote_rules(Some("starbus"), None).unwrap();
        assert_eq!(rules.slabs.len(), 2);
        assert!(quote_rules(Some("Nowhere Travels"), None).is_err());
    }

    #[test]
    fn refund_status_accepts_lower_case() {
        assert_eq!(
            parse_refund_status("processing").unwrap(),
            RefundStatus::Processing
        );
        assert!(parse_refund_status("refunded").is_err());
    }

    #[test]
    fn cli_rejects_out_of_range_hours() {
        let now = Utc::now();
        assert!(quote_departure(now, None, Some(1e16)).is_err());
        assert!(quote_departure(now, None, Some(f64::NAN)).is_err());
        assert!(quote_departure(now, None, Some(f64::NEG_INFINITY)).is_err());
        assert!(quote_departure(now, None, Some(2e12)).is_err());
        assert!(quote_departure(now, None, None).is_err());

        let departure = quote_departure(now, None, Some(-5.0)).unwrap();
        assert_eq!(departure, now - Duration::hours(5));
    }

    #[test]
    fn cli_parses_negative_hours() {
        let cli = Cli::try_parse_from(["trustroute", "quote", "--amount", "500", "--hours", "-5"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Quote { hours: Some(hours), .. } if hours == -5.0
        ));
    }
}
