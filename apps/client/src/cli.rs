//! Command surface.
//!
//! One parameterized binary covers what used to be two near-identical app
//! builds; the divergences (subscribe page, share links) are config flags,
//! not code paths.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};

use crate::access::{AnalysisReport, AnalyzeOutcome, NoteAccessState, PurchaseOutcome};
use crate::auth::Session;
use crate::errors::AppError;
use crate::state::AppState;
use crate::upload::{NoteDraft, MIN_QUALITY_SCORE};

#[derive(Parser)]
#[command(name = "campusnotes")]
#[command(about = "CampusNotes marketplace client", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an account and start a session
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Log in with an existing account
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Request a password reset link
    ForgotPassword {
        #[arg(long)]
        email: String,
    },
    /// Drop the stored session
    Logout,
    /// Show the current session identity
    Whoami,
    /// List notes in the marketplace
    Notes,
    /// Show a note, resolving its file URL when access is held
    Show { note_id: String },
    /// Purchase access to a note
    Purchase { note_id: String },
    /// Ask questions about a note's content
    Ask {
        note_id: String,
        #[arg(required = true)]
        questions: Vec<String>,
    },
    /// Score a PDF with the AI quality analysis
    Analyze {
        file: PathBuf,
        #[arg(long)]
        title: String,
        /// Pre-confirm an analysis-pack purchase if the quota is exhausted
        #[arg(long)]
        yes: bool,
    },
    /// Analyze and publish a note (the quality gate applies)
    Upload {
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        price: u32,
        /// Pre-confirm an analysis-pack purchase if the quota is exhausted
        #[arg(long)]
        yes: bool,
    },
    /// Buy a pack of 3 analyses
    BuyAnalyses {
        #[arg(long)]
        yes: bool,
    },
    /// Show balance and analysis allowance
    Balance,
    /// Show recent credit transactions
    History,
    /// Show subscription status and premium features
    Subscribe,
}

pub async fn run(mut state: AppState, cli: Cli) -> Result<()> {
    match cli.command {
        Command::Signup {
            name,
            email,
            password,
        } => {
            let token = state.api.signup(&name, &email, &password).await?;
            start_session(&mut state, &token).await?;
        }
        Command::Login { email, password } => {
            let token = state.api.login(&email, &password).await?;
            start_session(&mut state, &token).await?;
        }
        Command::ForgotPassword { email } => {
            state.api.forgot_password(&email).await?;
            println!("If your email exists, a reset link has been sent.");
        }
        Command::Logout => {
            state.controller.logout()?;
            println!("Logged out.");
        }
        Command::Whoami => whoami(&state),
        Command::Notes => list_notes(&mut state).await?,
        Command::Show { note_id } => show(&mut state, &note_id).await?,
        Command::Purchase { note_id } => purchase(&mut state, &note_id).await?,
        Command::Ask { note_id, questions } => ask(&mut state, &note_id, &questions).await?,
        Command::Analyze { file, title, yes } => analyze(&mut state, &file, &title, yes).await?,
        Command::Upload {
            file,
            title,
            description,
            price,
            yes,
        } => upload(&mut state, &file, title, description, price, yes).await?,
        Command::BuyAnalyses { yes } => buy_analyses(&mut state, yes).await?,
        Command::Balance => balance(&mut state).await?,
        Command::History => history(&mut state).await?,
        Command::Subscribe => subscribe(&mut state).await?,
    }
    Ok(())
}

async fn start_session(state: &mut AppState, token: &str) -> Result<()> {
    let session = Session::from_token(token)?;
    state.controller.attach_session(session)?;
    let profile = state.controller.refresh_profile().await?;
    println!(
        "Welcome, {}! Balance: {} CNX Token",
        profile.name, profile.credits
    );
    Ok(())
}

fn whoami(state: &AppState) {
    match state.controller.session() {
        Some(session) => {
            let claims = session.claims();
            println!("{} ({})", claims.name, claims.sub);
            if let Some(expiry) = chrono::DateTime::from_timestamp(claims.exp, 0) {
                println!("Session expires {}", expiry.to_rfc3339());
            }
        }
        None => println!("Not logged in."),
    }
}

async fn list_notes(state: &mut AppState) -> Result<()> {
    let token = state
        .controller
        .session()
        .map(|s| s.token().to_string());
    let result = state.api.list_notes(token.as_deref()).await;
    let notes = forward_auth(state, result)?;
    if notes.is_empty() {
        println!("No notes in the marketplace yet.");
        return Ok(());
    }
    for note in &notes {
        println!("{}  {:>4} CNX  {}", note.id, note.price, note.title);
        if let Some(description) = &note.description {
            println!("    {description}");
        }
    }
    Ok(())
}

async fn show(state: &mut AppState, note_id: &str) -> Result<()> {
    let denied = match state.controller.open_note(note_id).await {
        Ok(_) => None,
        Err(AppError::AccessDenied(message)) => Some(message),
        Err(e) => return Err(e.into()),
    };
    let view = state
        .controller
        .note_view(note_id)
        .ok_or_else(|| AppError::NotFound(format!("note {note_id}")))?;

    println!("{}", view.note.title);
    match &view.note.description {
        Some(description) => println!("{description}"),
        None => println!("No description available"),
    }
    if let Some(uploader) = &view.note.uploader {
        println!("Uploaded by: {}", uploader.name);
    }
    println!("Price: {} credits", view.note.price);
    if let Some(profile) = state.controller.profile() {
        println!("Your Credits: {}", profile.credits);
    }
    match &view.access {
        NoteAccessState::Unlocked { file_url } => {
            println!("File: {file_url}");
            if state.config.enable_sharing {
                println!("Share: {}/notes/{}", state.config.api_base_url, view.note.id);
            }
        }
        NoteAccessState::AccessDenied => println!(
            "{}",
            denied.unwrap_or_else(|| "access to this note was revoked server-side".to_string())
        ),
        NoteAccessState::Locked => {
            println!("Not purchased. Run `campusnotes purchase {note_id}` to unlock.")
        }
        NoteAccessState::Unlocking => println!("Purchase pending."),
    }
    Ok(())
}

async fn purchase(state: &mut AppState, note_id: &str) -> Result<()> {
    match state.controller.purchase(note_id).await? {
        PurchaseOutcome::Unlocked { file_url, credits } => {
            println!("Purchase complete. Balance: {credits} CNX Token");
            println!("File: {file_url}");
        }
        PurchaseOutcome::LoginRequired => {
            println!("Please log in first: campusnotes login --email <email> --password <pass>")
        }
        PurchaseOutcome::AlreadyOwned => println!("You already have access to this note."),
    }
    Ok(())
}

async fn ask(state: &mut AppState, note_id: &str, questions: &[String]) -> Result<()> {
    state.controller.open_note(note_id).await?;
    for question in questions {
        let entry = state.controller.ask(note_id, question).await?;
        println!("Q: {}", entry.question);
        println!("A: {}", entry.answer);
        println!();
    }
    Ok(())
}

async fn analyze(state: &mut AppState, file: &Path, title: &str, yes: bool) -> Result<()> {
    let (file_name, bytes) = read_file(file)?;
    let Some(report) = ensure_analysis(state, &file_name, bytes, title, yes).await? else {
        return Ok(());
    };
    print_report(&report);
    if report.quality_score >= MIN_QUALITY_SCORE {
        println!("This file clears the publishing threshold.");
    } else {
        println!("Below the publishing threshold of {MIN_QUALITY_SCORE}; upload would be rejected.");
    }
    Ok(())
}

async fn upload(
    state: &mut AppState,
    file: &Path,
    title: String,
    description: Option<String>,
    price: u32,
    yes: bool,
) -> Result<()> {
    let (file_name, bytes) = read_file(file)?;
    let Some(report) = ensure_analysis(state, &file_name, bytes.clone(), &title, yes).await? else {
        return Ok(());
    };
    print_report(&report);
    if report.quality_score < MIN_QUALITY_SCORE {
        anyhow::bail!(
            "quality score {:.1} is below the publishing threshold of {MIN_QUALITY_SCORE}",
            report.quality_score
        );
    }
    let note_id = state
        .controller
        .upload(NoteDraft {
            title,
            description,
            price,
            file_name,
            file: bytes,
        })
        .await?;
    println!("Note uploaded successfully! id: {note_id}");
    Ok(())
}

async fn buy_analyses(state: &mut AppState, yes: bool) -> Result<()> {
    state.controller.refresh_profile().await?;
    let offer = state.controller.request_pack_offer()?;
    println!(
        "A pack of {} analyses costs {} CNX Token.",
        offer.pack_size, offer.price
    );
    if yes || confirm("Purchase now?")? {
        let receipt = state.controller.confirm_pack_purchase().await?;
        println!(
            "Purchased {} analyses! New balance: {} CNX Token",
            offer.pack_size, receipt.credits
        );
    } else {
        state.controller.decline_pack_purchase();
        println!("Purchase declined.");
    }
    Ok(())
}

async fn balance(state: &mut AppState) -> Result<()> {
    let profile = state.controller.refresh_profile().await?;
    println!("CNX Token Balance: {}", profile.credits);
    println!("Free Analyses: {}/3", profile.free_analyses_remaining);
    println!("Purchased Analyses: {}", profile.purchased_analyses_remaining);
    if profile.is_premium {
        println!("SuperCampusNotes subscriber");
    }
    Ok(())
}

async fn history(state: &mut AppState) -> Result<()> {
    let token = bearer(state)?;
    let result = state.api.transactions(&token).await;
    let transactions = forward_auth(state, result)?;
    if transactions.is_empty() {
        println!("No transactions yet.");
        return Ok(());
    }
    for tx in &transactions {
        println!(
            "{}  {:+} credits  {}",
            tx.created_at.format("%Y-%m-%d"),
            tx.amount,
            tx.description
        );
    }
    Ok(())
}

async fn subscribe(state: &mut AppState) -> Result<()> {
    if !state.config.enable_subscribe {
        println!("Subscriptions are not available in this build.");
        return Ok(());
    }
    let premium = match state.controller.session() {
        Some(_) => state.controller.refresh_profile().await?.is_premium,
        None => false,
    };
    if premium {
        println!("You are already a SuperCampusNotes subscriber!");
        return Ok(());
    }
    println!("Upgrade to SuperCampusNotes for:");
    println!("  - Unlimited note summaries");
    println!("  - Unlimited question answering");
    println!("  - Unlimited flashcards with PDF export");
    println!("  - Personalized note recommendations");
    println!("  - Priority listing for your uploaded notes");
    println!("  - Monthly credit bonuses");
    println!("View pricing: https://campusnotes.com/pricing");
    Ok(())
}

/// Runs the analyze flow, walking the two-step pack-purchase prompt when the
/// quota is exhausted. Returns `None` when the user declines the purchase.
async fn ensure_analysis(
    state: &mut AppState,
    file_name: &str,
    file: Bytes,
    title: &str,
    preconfirmed: bool,
) -> Result<Option<AnalysisReport>> {
    state.controller.refresh_profile().await?;
    let mut purchased_this_run = false;
    loop {
        match state
            .controller
            .analyze(file_name, file.clone(), title)
            .await?
        {
            AnalyzeOutcome::Analyzed(report) => return Ok(Some(report)),
            AnalyzeOutcome::PurchaseRequired(offer) => {
                if purchased_this_run {
                    anyhow::bail!("quota still exhausted after purchasing a pack");
                }
                println!("Analysis quota exhausted.");
                println!(
                    "A pack of {} analyses costs {} CNX Token.",
                    offer.pack_size, offer.price
                );
                if !(preconfirmed || confirm("Purchase now?")?) {
                    state.controller.decline_pack_purchase();
                    println!("Purchase declined.");
                    return Ok(None);
                }
                let receipt = state.controller.confirm_pack_purchase().await?;
                println!(
                    "Purchased {} analyses! New balance: {} CNX Token",
                    offer.pack_size, receipt.credits
                );
                purchased_this_run = true;
            }
        }
    }
}

fn print_report(report: &AnalysisReport) {
    println!("Quality score: {:.1}/10", report.quality_score);
    println!("Summary: {}", report.summary);
    println!(
        "Analyses remaining: {} free, {} purchased",
        report.counts.free, report.counts.purchased
    );
}

fn read_file(path: &Path) -> Result<(String, Bytes)> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("note.pdf")
        .to_string();
    Ok((file_name, Bytes::from(bytes)))
}

fn bearer(state: &AppState) -> Result<String, AppError> {
    state
        .controller
        .session()
        .map(|s| s.token().to_string())
        .ok_or(AppError::Unauthorized)
}

/// A 401 from a session-free endpoint still tears the session down; the
/// controller is the one place that side effect lives.
fn forward_auth<T>(state: &mut AppState, result: Result<T, AppError>) -> Result<T, AppError> {
    if matches!(result, Err(AppError::Unauthorized)) {
        state.controller.invalidate_session();
    }
    result
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
