use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{error, info, warn};

use negotiation_core::config::AppConfig;
use negotiation_core::engine::{ContractStatus, ProposalDraft, StepDeletion, TicketTransition};
use negotiation_core::error::NegotiationError;
use negotiation_core::logging::init_logging;
use negotiation_core::models::{
    Conversation, ContractFile, ConversationId, Message, MessageKind, Money, StepDraft, StepId, TicketId, TicketView,
    UserId,
};
use negotiation_core::service::NegotiationService;
use negotiation_core::session::Session;

#[derive(Parser)]
#[command(author, version, about = "Negotiate proposals and contracts with your counterparts", long_about = None)]
struct Cli {
    /// Id of the signed-in user (or NEGOTIATION_USER_ID)
    #[arg(short, long, global = true)]
    user: Option<UserId>,

    /// Explicit configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations, most recent first
    Conversations,
    /// Start (or reopen) a conversation with another user
    Start {
        /// Counterpart user id
        #[arg(short, long)]
        with: UserId,
    },
    /// Show the tickets of a conversation with their steps
    Tickets {
        #[arg(short, long)]
        conversation: ConversationId,
    },
    /// Show the messages of a conversation
    Messages {
        #[arg(short, long)]
        conversation: ConversationId,

        /// Keep polling for new messages until interrupted
        #[arg(short, long)]
        follow: bool,
    },
    /// Send a plain message
    Send {
        #[arg(short, long)]
        conversation: ConversationId,

        /// Message text
        text: String,
    },
    /// Propose steps to the counterpart
    Propose {
        #[arg(short, long)]
        conversation: ConversationId,

        /// Step as "title=price", repeatable (e.g. --step "Projeto=1500,00")
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,

        /// Contract PDF to attach
        #[arg(long)]
        contract: Option<PathBuf>,
    },
    /// Accept a proposal; its first step starts
    Accept {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
    },
    /// Reject a proposal
    Reject {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
    },
    /// Provider: mark a step's work as done
    CompleteStep {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
        #[arg(short, long)]
        step: StepId,
    },
    /// Client: confirm a completed step; the next one starts
    ConfirmStep {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
        #[arg(short, long)]
        step: StepId,
    },
    /// Delete a step; the last step takes its ticket with it
    DeleteStep {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
        #[arg(short, long)]
        step: StepId,
    },
    /// Sign an accepted contract (asks for your password)
    Sign {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,
    },
    /// Save a ticket's contract PDF to disk
    FetchContract {
        #[arg(short, long)]
        conversation: ConversationId,
        #[arg(short, long)]
        ticket: TicketId,

        /// Destination file
        #[arg(short, long, default_value = "contrato.pdf")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    // Initialize logging
    let log_file = config.logging.file_path.as_deref().map(Path::new);
    let guard = init_logging(Some(&config.get_log_level()), log_file, config.logging.format == "json")?;

    info!("Starting negotiate");

    if let Err(e) = run(&cli, &config).await {
        match e.downcast_ref::<NegotiationError>() {
            Some(negotiation) => {
                error!(error = %negotiation, "command failed");
                eprintln!("{}", negotiation.user_message());
            }
            None => {
                error!(error = %e, "command failed");
                eprintln!("Error: {e:#}");
            }
        }
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli, config: &AppConfig) -> Result<()> {
    let service = NegotiationService::from_config(config)?;
    let session = open_session(&service, cli.user).await?;

    match &cli.command {
        Commands::Conversations => list_conversations(&service, &session).await?,
        Commands::Start { with } => {
            let conversation = service.resolver().start_conversation(&session, *with).await?;
            println!("Conversa #{} com {}", conversation.id, conversation.counterpart.name);
        }
        Commands::Tickets { conversation } => {
            let conversation = service.select_conversation(&session, *conversation).await?;
            for view in service.engine().tickets(&session, &conversation).await? {
                print_ticket(&view);
            }
        }
        Commands::Messages { conversation, follow } => {
            let conversation = service.select_conversation(&session, *conversation).await?;
            show_messages(&service, &session, &conversation, *follow).await?;
        }
        Commands::Send { conversation, text } => {
            let conversation = service.select_conversation(&session, *conversation).await?;
            let messaging = service.messaging();
            messaging.set_draft(conversation.id, text.clone());
            let sent = messaging.send_draft(&session, conversation.id).await?;
            info!(message_id = sent.id, "message sent");
        }
        Commands::Propose {
            conversation,
            steps,
            contract,
        } => propose(&service, &session, *conversation, steps, contract.as_deref()).await?,
        Commands::Accept { conversation, ticket } => {
            transition(&service, &session, *conversation, *ticket, TicketTransition::Accept).await?;
        }
        Commands::Reject { conversation, ticket } => {
            transition(&service, &session, *conversation, *ticket, TicketTransition::Reject).await?;
        }
        Commands::CompleteStep {
            conversation,
            ticket,
            step,
        } => {
            let (conversation, view) = load_ticket(&service, &session, *conversation, *ticket).await?;
            let step = find_step(&view, *step)?;
            let updated = service
                .engine()
                .mark_step_completed(&session, conversation.id, step)
                .await?;
            println!("Etapa \"{}\" aguardando confirmação do cliente", updated.title);
        }
        Commands::ConfirmStep {
            conversation,
            ticket,
            step,
        } => {
            let (_, view) = load_ticket(&service, &session, *conversation, *ticket).await?;
            let step = find_step(&view, *step)?;
            let advance = service
                .engine()
                .confirm_step_completion(&session, step, &view.ticket)
                .await?;
            println!("Etapa \"{}\" concluída", advance.confirmed.title);
            if let Some(next) = advance.activated {
                println!("Etapa \"{}\" iniciada", next.title);
            }
        }
        Commands::DeleteStep {
            conversation,
            ticket,
            step,
        } => {
            let (conversation, view) = load_ticket(&service, &session, *conversation, *ticket).await?;
            let step = find_step(&view, *step)?;
            match service.engine().delete_step(&session, Some(&conversation), step).await? {
                StepDeletion::StepRemoved { remaining } => println!("Etapa removida, restam {remaining}"),
                StepDeletion::TicketRemoved { ticket_id } => {
                    println!("Última etapa removida, proposta #{ticket_id} excluída");
                }
            }
        }
        Commands::Sign { conversation, ticket } => {
            let (_, view) = load_ticket(&service, &session, *conversation, *ticket).await?;
            let password = rpassword::prompt_password("Senha: ").context("Failed to read password")?;
            let receipt = service
                .engine()
                .sign_document(&session, &view.ticket, &password)
                .await?;
            println!("Contrato assinado em {}", receipt.signed_at.format("%d/%m/%Y %H:%M"));
            if !receipt.notice_sent {
                warn!(ticket_id = view.ticket.id, "signature notice was not posted");
                println!("Assinatura registrada, mas o aviso no chat não foi enviado.");
            }
        }
        Commands::FetchContract {
            conversation,
            ticket,
            output,
        } => {
            let (_, view) = load_ticket(&service, &session, *conversation, *ticket).await?;
            let bytes = service.engine().fetch_attachment(&session, &view.ticket).await?;
            tokio::fs::write(output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Contrato salvo em {} ({} bytes)", output.display(), bytes.len());
        }
    }

    Ok(())
}

async fn open_session(service: &NegotiationService, user: Option<UserId>) -> Result<Session> {
    let user_id = match user {
        Some(id) => id,
        None => std::env::var("NEGOTIATION_USER_ID")
            .context("No user given: pass --user or set NEGOTIATION_USER_ID")?
            .trim()
            .parse()
            .context("NEGOTIATION_USER_ID must be a numeric user id")?,
    };
    let token = std::env::var("NEGOTIATION_TOKEN").ok().filter(|t| !t.trim().is_empty());
    if token.is_none() {
        warn!("NEGOTIATION_TOKEN is not set, requests go out unauthenticated");
    }
    Ok(service.session_for(user_id, token).await?)
}

async fn list_conversations(service: &NegotiationService, session: &Session) -> Result<()> {
    let conversations = service.resolver().conversations(session).await?;
    if conversations.is_empty() {
        println!("Nenhuma conversa");
    }
    for conversation in conversations {
        let last = conversation
            .last_activity()
            .map_or_else(|| "-".to_string(), |t| t.format("%d/%m/%Y %H:%M").to_string());
        println!("#{:<6} {:<30} {}", conversation.id, conversation.counterpart.name, last);
    }
    Ok(())
}

async fn show_messages(
    service: &NegotiationService,
    session: &Session,
    conversation: &Conversation,
    follow: bool,
) -> Result<()> {
    let mut seen = HashSet::new();
    for message in service.messaging().list_messages(session, conversation.id).await? {
        seen.insert(message.id);
        print_message(session, conversation, &message);
    }
    if !follow {
        return Ok(());
    }

    let stream = service.messaging().poll_messages(session.clone(), conversation.id);
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(messages)) => {
                    for message in messages {
                        if seen.insert(message.id) {
                            print_message(session, conversation, &message);
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "poll failed, retrying"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                service.close_conversation();
                break;
            }
        }
    }
    Ok(())
}

async fn propose(
    service: &NegotiationService,
    session: &Session,
    conversation: ConversationId,
    steps: &[String],
    contract: Option<&Path>,
) -> Result<()> {
    let conversation = service.select_conversation(session, conversation).await?;
    let steps = steps.iter().map(|raw| parse_step(raw)).collect::<Result<Vec<_>>>()?;

    let contract = match contract {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read contract {}", path.display()))?;
            let file_name = path
                .file_name()
                .map_or_else(|| "contrato.pdf".to_string(), |n| n.to_string_lossy().into_owned());
            Some(ContractFile { file_name, bytes })
        }
        None => None,
    };

    let receipt = service
        .engine()
        .create_proposal(session, Some(&conversation), ProposalDraft { steps, contract })
        .await?;
    println!(
        "Proposta #{} enviada: {} etapa(s), total R$ {}",
        receipt.ticket_id,
        receipt.steps.len(),
        receipt.total
    );
    if let Some(notice) = receipt.notice() {
        println!("{notice}");
    }
    if let ContractStatus::Missing { reason } = &receipt.contract {
        warn!(ticket_id = receipt.ticket_id, %reason, "contract missing from proposal");
    }
    Ok(())
}

async fn transition(
    service: &NegotiationService,
    session: &Session,
    conversation: ConversationId,
    ticket: TicketId,
    transition: TicketTransition,
) -> Result<()> {
    let (_, view) = load_ticket(service, session, conversation, ticket).await?;
    let updated = service
        .engine()
        .update_ticket_status(session, &view.ticket, transition)
        .await?;
    println!("Proposta #{} agora está {}", updated.id, updated.status_str());
    Ok(())
}

async fn load_ticket(
    service: &NegotiationService,
    session: &Session,
    conversation: ConversationId,
    ticket: TicketId,
) -> Result<(Conversation, TicketView)> {
    let conversation = service.select_conversation(session, conversation).await?;
    let view = service
        .engine()
        .ticket_view(session, &conversation, ticket)
        .await?
        .ok_or_else(|| anyhow!("Ticket {ticket} not found in conversation {}", conversation.id))?;
    Ok((conversation, view))
}

fn find_step(view: &TicketView, step: StepId) -> Result<&negotiation_core::models::Step> {
    view.steps
        .iter()
        .find(|s| s.id == step)
        .ok_or_else(|| anyhow!("Step {step} not found in ticket {}", view.ticket.id))
}

/// Parse "title=price"; the last '=' separates the price.
fn parse_step(raw: &str) -> Result<StepDraft> {
    let Some((title, price)) = raw.rsplit_once('=') else {
        bail!("Invalid step {raw:?}, expected \"title=price\"");
    };
    let price = Money::parse(price).ok_or_else(|| anyhow!("Invalid price in step {raw:?}"))?;
    Ok(StepDraft::new(title.trim(), price))
}

fn print_ticket(view: &TicketView) {
    let status = match view.ticket.status_str() {
        "" => "sem status",
        other => other,
    };
    println!("Proposta #{} [{}] total R$ {}", view.ticket.id, status, view.total);
    for step in &view.steps {
        println!(
            "  #{:<6} {:<30} R$ {:>10}  {:?}{}{}",
            step.id,
            step.title,
            step.price,
            step.status,
            if step.provider_completed { " ✔ prestador" } else { "" },
            if step.client_confirmed { " ✔ cliente" } else { "" },
        );
    }
}

fn print_message(session: &Session, conversation: &Conversation, message: &Message) {
    let author = if message.sender_id == session.user_id() {
        "você".to_string()
    } else {
        conversation.counterpart.name.clone()
    };
    let at = message
        .created_at
        .map_or_else(String::new, |t| t.format("%d/%m %H:%M").to_string());
    match (&message.kind, &message.proposal) {
        (MessageKind::Proposal, Some(snapshot)) => {
            println!("[{at}] {author}: proposta #{} (como enviada)", snapshot.ticket_id);
            for step in &snapshot.steps {
                println!("    - {} R$ {}", step.title, step.price);
            }
            println!("    total R$ {}", snapshot.total);
        }
        _ => println!("[{at}] {author}: {}", message.content),
    }
}
