//! Line-oriented play over stdin/stdout.
//!
//! - Lines starting with `#` are commands (save, load, edit, reroll, ...)
//! - Every other line is sent as the player's action
//! - Narration streams to stdout as it arrives; tags like `[SAVED]` and
//!   `[ERROR]` mark everything else

use host::{Backend, Model};
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use xiuxian_core::{
    Character, CharacterBuilder, GameSession, Gender, Message, MessageId, MessageStatus,
    MigrationOutcome, Sender, SessionConfig, SessionError, TurnOutcome,
};

/// Options gathered from the command line.
#[derive(Debug, Clone)]
pub struct GameOptions {
    pub name: String,
    pub gender: Gender,
    pub race: String,
    pub path: String,
    pub region: String,
    pub age: u32,
    pub model: Model,
    pub max_tokens: Option<u32>,
    pub data_dir: PathBuf,
    /// Resume from the autosave instead of starting fresh.
    pub resume: bool,
}

impl GameOptions {
    pub fn quick_start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gender: Gender::default(),
            race: "Human".to_string(),
            path: "Orthodox Dao".to_string(),
            region: "Azure Cloud Town".to_string(),
            age: 16,
            model: Model::default(),
            max_tokens: None,
            data_dir: std::env::var("XIUXIAN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            resume: false,
        }
    }

    pub fn character(&self) -> Character {
        CharacterBuilder::new(&self.name)
            .gender(self.gender)
            .race(&self.race)
            .path(&self.path)
            .location(&self.region)
            .age(self.age)
            .build()
    }

    pub fn session_config(&self) -> SessionConfig {
        let config = SessionConfig::new().with_model(self.model);
        match self.max_tokens {
            Some(tokens) => config.with_max_tokens(tokens),
            None => config,
        }
    }
}

/// Prints cumulative display text as it grows.
///
/// Display text normally only grows. When it does not (a state block was
/// cut out mid-stream) nothing more is printed until the final text.
#[derive(Default)]
struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    fn update(&mut self, text: &str) {
        if let Some(rest) = text.strip_prefix(self.printed.as_str()) {
            if !rest.is_empty() {
                print!("{rest}");
                io::stdout().flush().ok();
                self.printed = text.to_string();
            }
        }
    }

    /// Finish the streamed block, reprinting if the final text diverged.
    fn finish(&self, outcome: &TurnOutcome) {
        if self.printed.trim() == outcome.content {
            println!();
        } else {
            println!();
            println!("[NARRATOR]");
            println!("{}", outcome.content);
        }
        if outcome.malformed_block {
            println!("[WARNING] The narrator's state update could not be read");
        }
        if let Some(update) = &outcome.state_update {
            let keys: Vec<&str> = update.keys().map(String::as_str).collect();
            println!("[STATE] {}", keys.join(", "));
        }
        println!();
    }
}

/// Run the game until stdin closes or `#quit`.
pub async fn run_headless(backend: Arc<Backend>, options: GameOptions) -> Result<(), SessionError> {
    let mut session = GameSession::new(backend, options.character(), options.session_config());

    let online = session.await_ready().await;
    if online {
        match session.persistence().migrate_legacy().await {
            Ok(MigrationOutcome::Migrated { imported, ignored }) => {
                println!("[MIGRATED] Imported {imported} old saves ({ignored} ignored)");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Legacy migration failed, will retry next start"),
        }
    } else {
        println!("[OFFLINE] Host not available. Saves stay on this machine and narration is disabled.");
    }

    println!("=== Xiuxian ===");

    let resumed = options.resume && resume(&mut session).await;
    print_status(session.character());
    println!();

    if resumed {
        print_messages(session.log().tail(6));
    } else {
        print_messages(session.log().messages());
        if online {
            let mut printer = StreamPrinter::default();
            println!("[NARRATOR]");
            match until_ctrl_c(session.start(|text, _| printer.update(text))).await {
                Some(Ok(outcome)) => printer.finish(&outcome),
                Some(Err(e)) => println!("\n[ERROR] {e}"),
                None => cancelled(&mut session),
            }
        }
    }

    println!("Enter your actions (one per line), or #help for commands:");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = io::stdout();

    // Ctrl-C while waiting for input quits; during a turn it cancels the turn.
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Farewell, cultivator.");
                break;
            }
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('#') {
            if !run_command(&mut session, command).await {
                println!("Farewell, cultivator.");
                break;
            }
            stdout.flush().ok();
            continue;
        }

        let mut printer = StreamPrinter::default();
        println!("[NARRATOR]");
        match until_ctrl_c(session.send(line, |text, _| printer.update(text))).await {
            Some(Ok(outcome)) => printer.finish(&outcome),
            Some(Err(e)) => println!("\n[ERROR] {e}"),
            None => cancelled(&mut session),
        }
    }

    Ok(())
}

/// Drive a turn to completion, or drop it when Ctrl-C arrives first.
async fn until_ctrl_c<T>(turn: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        result = turn => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    }
}

/// Give the player control back after a dropped turn.
fn cancelled(session: &mut GameSession) {
    session.abandon_turn();
    println!();
    println!("[CANCELLED] The host may still be generating; its reply will be discarded.");
}

async fn resume(session: &mut GameSession) -> bool {
    match session.resume_auto_save().await {
        Ok(true) => {
            println!("[LOADED] Resumed from autosave");
            true
        }
        Ok(false) => {
            println!("[ERROR] No autosave found, starting a new game");
            false
        }
        Err(e) => {
            println!("[ERROR] Could not read autosave: {e}");
            false
        }
    }
}

/// Handle a `#` command. Returns false to quit.
async fn run_command(session: &mut GameSession, command: &str) -> bool {
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match name {
        "quit" | "exit" => return false,
        "save" => match parse_slot(rest) {
            Some(slot) => match session.save(slot).await {
                Ok(()) => println!("[SAVED] Slot {slot}"),
                Err(e) => println!("[ERROR] Save failed: {e}"),
            },
            None => println!("[ERROR] Usage: #save <slot>"),
        },
        "load" => match parse_slot(rest) {
            Some(slot) => match session.load(slot).await {
                Ok(()) => {
                    println!("[LOADED] Slot {slot}");
                    print_status(session.character());
                    print_messages(session.log().tail(6));
                }
                Err(e) => println!("[ERROR] Load failed: {e}"),
            },
            None => println!("[ERROR] Usage: #load <slot>"),
        },
        "delete" => match parse_slot(rest) {
            Some(slot) => match session.delete_slot(slot).await {
                Ok(()) => println!("[DELETED] Slot {slot}"),
                Err(e) => println!("[ERROR] Delete failed: {e}"),
            },
            None => println!("[ERROR] Usage: #delete <slot>"),
        },
        "slots" => {
            for (i, preview) in session.slot_previews().await.iter().enumerate() {
                match preview {
                    Some(p) => println!(
                        "[SLOT {}] {} - {} ({} messages)",
                        i + 1,
                        p.character_name,
                        p.summary,
                        p.message_count
                    ),
                    None => println!("[SLOT {}] empty", i + 1),
                }
            }
        }
        "status" => print_status(session.character()),
        "log" => {
            let count = rest.parse().unwrap_or(10);
            print_messages(session.log().tail(count));
        }
        "undo" => match parse_id(rest) {
            Some(id) => match session.delete(id) {
                Ok(removed) => println!("[DELETED] {removed} messages"),
                Err(e) => println!("[ERROR] {e}"),
            },
            None => println!("[ERROR] Usage: #undo <message id>"),
        },
        "edit" => {
            let (id, text) = match rest.split_once(char::is_whitespace) {
                Some((id, text)) => (parse_id(id), text.trim()),
                None => (None, ""),
            };
            match id {
                Some(id) if !text.is_empty() => {
                    let mut printer = StreamPrinter::default();
                    match until_ctrl_c(session.edit(id, text, |t, _| printer.update(t))).await {
                        Some(Ok(Some(outcome))) => printer.finish(&outcome),
                        Some(Ok(None)) => println!("[EDITED] Message {id}"),
                        Some(Err(e)) => println!("\n[ERROR] {e}"),
                        None => cancelled(session),
                    }
                }
                _ => println!("[ERROR] Usage: #edit <message id> <text>"),
            }
        }
        "reroll" => {
            let id = if rest.is_empty() {
                session.log().last_narrator_id()
            } else {
                parse_id(rest)
            };
            match id {
                Some(id) => {
                    let mut printer = StreamPrinter::default();
                    println!("[NARRATOR]");
                    match until_ctrl_c(session.reroll(id, |t, _| printer.update(t))).await {
                        Some(Ok(outcome)) => printer.finish(&outcome),
                        Some(Err(e)) => println!("\n[ERROR] {e}"),
                        None => cancelled(session),
                    }
                }
                None => println!("[ERROR] Usage: #reroll [message id]"),
            }
        }
        "model" => {
            if rest.is_empty() {
                let current = session.narrator().model();
                for model in Model::ALL {
                    let marker = if model == current { "*" } else { " " };
                    println!("{marker} {:<22} {:<8} {}", model.id(), model.name(), model.description());
                }
            } else {
                match Model::from_id(rest) {
                    Some(model) => {
                        session.set_model(model);
                        println!("[MODEL] {}", model.name());
                    }
                    None => println!("[ERROR] Unknown model: {rest}"),
                }
            }
        }
        "help" => print_help(),
        _ => println!("[ERROR] Unknown command. Type #help for help."),
    }

    true
}

fn parse_slot(s: &str) -> Option<u8> {
    s.trim().parse().ok()
}

fn parse_id(s: &str) -> Option<MessageId> {
    s.trim().parse().ok().map(MessageId)
}

fn print_status(character: &Character) {
    println!("[STATUS]");
    println!(
        "  {} ({}, {}) - {}",
        character.name,
        character.gender.name(),
        character.race,
        character.path
    );
    println!("  Location: {}", character.location);
    println!("  Date: {}", character.date);
    println!(
        "  Physique: {} [{}]",
        character.physique.name,
        character.physique.grade.name()
    );
    println!(
        "  Comprehension: {} [{}]",
        character.comprehension.name,
        character.comprehension.grade.name()
    );
    println!(
        "  Relic: {} [{}]",
        character.relic.name,
        character.relic.grade.name()
    );
    for (key, value) in character.variables.iter() {
        println!("  {key}: {value}");
    }
    if !character.inventory.is_empty() {
        println!("  Inventory: {}", character.inventory.join(", "));
    }
}

fn print_messages(messages: &[Message]) {
    for message in messages {
        let who = match message.sender {
            Sender::Narrator => "NARRATOR",
            Sender::Player => "YOU",
            Sender::Npc => message.sender_name.as_deref().unwrap_or("NPC"),
        };
        let marker = match message.status {
            MessageStatus::Complete => "",
            MessageStatus::Pending => " (pending)",
            MessageStatus::Failed => " (failed)",
        };
        println!("[{}] {who}{marker}: {}", message.id, message.content);
    }
}

fn print_help() {
    println!("[HELP]");
    println!("  #save <slot>          - Save to slot 1-6");
    println!("  #load <slot>          - Load slot 1-6");
    println!("  #delete <slot>        - Delete a save slot");
    println!("  #slots                - List save slots");
    println!("  #status               - Show your character");
    println!("  #log [n]              - Show the last n messages");
    println!("  #undo <id>            - Delete a message and everything after it");
    println!("  #edit <id> <text>     - Rewrite a message (your own turns are replayed)");
    println!("  #reroll [id]          - Regenerate a narration (default: the latest)");
    println!("  #model [id]           - List models or switch model");
    println!("  #quit                 - Exit the game");
    println!("  Ctrl-C                - Cancel a running narration");
    println!("  (anything else is sent as your action)");
}

/// Parse game options from command line arguments.
pub fn parse_options_from_args(args: &[String]) -> GameOptions {
    let mut options = GameOptions::quick_start("Wanderer");

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--name" => {
                if let Some(name) = args.get(i + 1) {
                    options.name = name.clone();
                    i += 1;
                }
            }
            "--gender" => {
                if let Some(gender) = args.get(i + 1) {
                    options.gender = Gender::from_label(gender).unwrap_or_default();
                    i += 1;
                }
            }
            "--race" => {
                if let Some(race) = args.get(i + 1) {
                    options.race = race.clone();
                    i += 1;
                }
            }
            "--path" => {
                if let Some(path) = args.get(i + 1) {
                    options.path = path.clone();
                    i += 1;
                }
            }
            "--region" => {
                if let Some(region) = args.get(i + 1) {
                    options.region = region.clone();
                    i += 1;
                }
            }
            "--age" => {
                if let Some(age) = args.get(i + 1) {
                    options.age = age.parse().unwrap_or(16);
                    i += 1;
                }
            }
            "--model" => {
                if let Some(model) = args.get(i + 1) {
                    options.model = Model::from_id(model).unwrap_or_default();
                    i += 1;
                }
            }
            "--max-tokens" => {
                if let Some(tokens) = args.get(i + 1) {
                    options.max_tokens = tokens.parse().ok();
                    i += 1;
                }
            }
            "--data-dir" => {
                if let Some(dir) = args.get(i + 1) {
                    options.data_dir = PathBuf::from(dir);
                    i += 1;
                }
            }
            "--continue" => options.resume = true,
            _ => {}
        }
        i += 1;
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_options() {
        let options = parse_options_from_args(&args(&[
            "xiuxian", "--name", "Su Yan", "--gender", "female", "--path", "Alchemy",
            "--region", "Misty Peak", "--age", "19", "--model", "turbo", "--continue",
        ]));

        assert_eq!(options.name, "Su Yan");
        assert_eq!(options.gender, Gender::Female);
        assert_eq!(options.path, "Alchemy");
        assert_eq!(options.model, Model::Turbo);
        assert!(options.resume);

        let character = options.character();
        assert_eq!(character.location, "Misty Peak");
        assert_eq!(character.variables.text("lifespan"), "19");
    }

    #[test]
    fn test_parse_options_defaults() {
        let options = parse_options_from_args(&args(&["xiuxian", "--age", "old", "--model", "nope"]));
        assert_eq!(options.name, "Wanderer");
        assert_eq!(options.age, 16);
        assert_eq!(options.model, Model::Xl);
        assert!(!options.resume);
        assert_eq!(options.session_config().max_tokens, 2500);
    }

    #[test]
    fn test_stream_printer_tracks_prefix() {
        let mut printer = StreamPrinter::default();
        printer.update("You");
        printer.update("You found");
        assert_eq!(printer.printed, "You found");

        // Shrunk text is held back rather than reprinted.
        printer.update("You");
        assert_eq!(printer.printed, "You found");
    }
}
