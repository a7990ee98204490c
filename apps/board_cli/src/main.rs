use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use board_sync::{
    load_settings_from, spawn_engine, ChangeCause, HttpBoardService, SessionEvent, SessionView,
    SyncHandle,
};
use clap::{Parser, Subcommand};
use shared::domain::{BoardId, CardId, ListId, TargetIndex};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Config file; `board_sync.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the boards of the session user.
    Boards,
    /// Open a board and print it whenever it changes.
    Watch {
        #[arg(long = "board")]
        board_id: i64,
    },
    MoveCard {
        #[arg(long = "board")]
        board_id: i64,
        #[arg(long = "card")]
        card_id: i64,
        #[arg(long = "list")]
        list_id: i64,
        #[arg(long, conflicts_with = "end")]
        index: Option<usize>,
        /// Append to the end of the target list.
        #[arg(long)]
        end: bool,
    },
    MoveList {
        #[arg(long = "board")]
        board_id: i64,
        #[arg(long = "list")]
        list_id: i64,
        #[arg(long = "to-board")]
        target_board_id: i64,
    },
    MoveBoard {
        #[arg(long = "board")]
        board_id: i64,
        #[arg(long)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(cli.config.as_deref())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    let service = Arc::new(HttpBoardService::new(&settings).context("invalid service url")?);
    info!(server_url = %service.base_url(), "connecting");
    let (handle, task) = spawn_engine(service.clone(), service, &settings);
    let patience = settings.request_timeout * 3;

    let outcome = run(&handle, cli.command, patience).await;

    let _ = handle.shutdown().await;
    let _ = task.await;
    outcome
}

async fn run(handle: &SyncHandle, command: Command, patience: Duration) -> Result<()> {
    match command {
        Command::Boards => {
            let events = handle.subscribe_events();
            handle.refresh().await?;
            await_directory(events, patience).await?;
            for board in handle.view().directory {
                println!("[{}] {}", board.id, board.title);
            }
            Ok(())
        }
        Command::Watch { board_id } => watch(handle, BoardId(board_id), patience).await,
        Command::MoveCard {
            board_id,
            card_id,
            list_id,
            index,
            end,
        } => {
            let index = match (index, end) {
                (Some(index), _) => TargetIndex::At(index),
                (None, true) => TargetIndex::End,
                (None, false) => bail!("pass --index <n> or --end"),
            };
            open(handle, BoardId(board_id), patience).await?;
            let events = handle.subscribe_events();
            handle
                .move_card_to(CardId(card_id), ListId(list_id), index)
                .await?;
            await_move(events, patience).await
        }
        Command::MoveList {
            board_id,
            list_id,
            target_board_id,
        } => {
            open(handle, BoardId(board_id), patience).await?;
            let events = handle.subscribe_events();
            handle
                .move_list_to_board(ListId(list_id), BoardId(target_board_id))
                .await?;
            await_move(events, patience).await
        }
        Command::MoveBoard { board_id, index } => {
            let events = handle.subscribe_events();
            handle.refresh().await?;
            await_directory(events, patience).await?;
            let events = handle.subscribe_events();
            handle
                .move_board(BoardId(board_id), TargetIndex::At(index))
                .await?;
            await_move(events, patience).await
        }
    }
}

/// Opens a board and waits for its first snapshot.
async fn open(handle: &SyncHandle, board_id: BoardId, patience: Duration) -> Result<()> {
    handle.open_board(board_id).await?;
    let mut view = handle.watch_view();
    tokio::time::timeout(
        patience,
        view.wait_for(|view| {
            view.open_board == Some(board_id) && view.board.is_some() && !view.loading
        }),
    )
    .await
    .with_context(|| format!("board {board_id} did not load"))?
    .map_err(|_| anyhow!("sync engine stopped"))?;
    Ok(())
}

async fn await_directory(mut events: broadcast::Receiver<SessionEvent>, patience: Duration) -> Result<()> {
    tokio::time::timeout(patience, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Changed {
                    board_id: None,
                    cause: ChangeCause::Resync,
                }) => return Ok(()),
                Ok(SessionEvent::Notice(notice)) => bail!(notice),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "missed session events"),
                Err(RecvError::Closed) => bail!("sync engine stopped"),
            }
        }
    })
    .await
    .context("timed out loading boards")?
}

async fn await_move(mut events: broadcast::Receiver<SessionEvent>, patience: Duration) -> Result<()> {
    tokio::time::timeout(patience, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::MoveConfirmed { ticket, .. }) => {
                    println!("move {ticket} confirmed");
                    return Ok(());
                }
                Ok(SessionEvent::MoveFailed { message, .. }) => bail!("move failed: {message}"),
                Ok(SessionEvent::Changed {
                    cause: ChangeCause::Rollback,
                    ..
                }) => bail!("move was rolled back"),
                Ok(SessionEvent::Notice(notice)) => bail!(notice),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "missed session events"),
                Err(RecvError::Closed) => bail!("sync engine stopped"),
            }
        }
    })
    .await
    .context("timed out waiting for the service")?
}

async fn watch(handle: &SyncHandle, board_id: BoardId, patience: Duration) -> Result<()> {
    open(handle, board_id, patience).await?;
    let mut events = handle.subscribe_events();
    print_board(&handle.view());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(SessionEvent::Changed { board_id: Some(_), .. }) => print_board(&handle.view()),
                Ok(SessionEvent::SubscriptionChanged { state, .. }) => println!("-- stream {state:?}"),
                Ok(SessionEvent::PossiblyStale { stale, .. }) => {
                    println!("-- {}", if stale { "possibly stale" } else { "live again" });
                }
                Ok(SessionEvent::MoveFailed { ticket, message, .. }) => {
                    println!("-- move {ticket} failed: {message}");
                }
                Ok(SessionEvent::Notice(notice)) => println!("-- {notice}"),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "missed session events");
                    print_board(&handle.view());
                }
                Err(RecvError::Closed) => bail!("sync engine stopped"),
            },
        }
    }
}

fn print_board(view: &SessionView) {
    let Some(board) = &view.board else {
        return;
    };
    let stale = if view.possibly_stale { " (possibly stale)" } else { "" };
    println!("== [{}] {}{stale}", board.board.id, board.board.title);
    for list in &board.lists {
        println!("  [{}] {}", list.list.id, list.list.title);
        for card in &list.cards {
            println!("    - [{}] {}", card.id, card.title);
        }
    }
}
