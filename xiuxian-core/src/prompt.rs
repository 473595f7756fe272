//! Prompt assembly.
//!
//! Everything here is a pure function of its inputs, so the exact turn
//! sequence sent to the host can be checked in tests.

use crate::character::{AttributeRoll, Character, REALMS, VARIABLE_KEYS};
use crate::log::{Message, MessageStatus, Sender};
use host::Turn;
use serde_json::{Map, Value};

/// How many history turns are replayed to the host.
pub const HISTORY_WINDOW: usize = 15;

/// Assistant turn inserted after the system prompt.
pub const ACKNOWLEDGEMENT: &str =
    "Understood. As the Heavenly Dao narrator, I will tell the story of your path to immortality.";

const OPTIONS_OPEN: &str = "<options>";
const OPTIONS_CLOSE: &str = "</options>";

/// Variables echoed back as the example block of the format contract.
const EXAMPLE_KEYS: [&str; 6] = ["realm", "lifespan", "currency", "condition", "renown", "fortune"];

/// Turns for a regular response.
///
/// Order: system prompt, acknowledgement, the last [`HISTORY_WINDOW`] history
/// turns with option menus removed, the new input in `<last_input>` tags, and
/// finally the output format contract.
pub fn build_turns(character: &Character, history: &[Message], input: &str) -> Vec<Turn> {
    let history = history_turns(history);
    let start = history.len().saturating_sub(HISTORY_WINDOW);

    let mut turns = Vec::with_capacity(HISTORY_WINDOW + 4);
    turns.push(Turn::user(system_prompt(character)));
    turns.push(Turn::assistant(ACKNOWLEDGEMENT));
    turns.extend(history.into_iter().skip(start).map(|mut turn| {
        turn.text = strip_options(&turn.text);
        turn
    }));
    turns.push(Turn::user(format!("<last_input>\n{input}\n</last_input>")));
    turns.push(Turn::user(format_contract(character)));
    turns
}

/// Turns for the opening scene. No history and no player input.
pub fn build_opening_turns(character: &Character) -> Vec<Turn> {
    let instructions = include_str!("prompts/opening.txt")
        .replace("{location}", &character.location)
        .replace("{race}", &character.race);

    vec![
        Turn::user(system_prompt(character)),
        Turn::assistant(ACKNOWLEDGEMENT),
        Turn::user(instructions),
        Turn::user(format_contract(character)),
    ]
}

/// Convert log messages to turns. Player messages become user turns and
/// everything else assistant turns; pending and failed turns are left out.
pub fn history_turns(messages: &[Message]) -> Vec<Turn> {
    messages
        .iter()
        .filter(|m| m.status == MessageStatus::Complete)
        .map(|m| match m.sender {
            Sender::Player => Turn::user(&m.content),
            Sender::Narrator => Turn::assistant(&m.content),
            Sender::Npc => match &m.sender_name {
                Some(name) => Turn::assistant(format!("{name}: {}", m.content)),
                None => Turn::assistant(&m.content),
            },
        })
        .collect()
}

/// Remove `<options>...</options>` menus left in earlier turns, then trim.
pub fn strip_options(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find(OPTIONS_OPEN) {
        let Some(close) = rest[open..].find(OPTIONS_CLOSE) else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &rest[open + close + OPTIONS_CLOSE.len()..];
    }
    out.push_str(rest);

    out.trim().to_string()
}

/// World rules, realm ladder, character profile and narration rules.
pub fn system_prompt(character: &Character) -> String {
    let mut prompt = String::new();

    prompt.push_str(include_str!("prompts/world.txt"));

    prompt.push_str("\n<realms>\nRealms, lowest to highest:\n");
    for (i, realm) in REALMS.iter().enumerate() {
        prompt.push_str(&format!("{}. {realm}\n", i + 1));
    }
    prompt.push_str(
        "\nEach realm has early, middle, late and perfected stages.\n\
         Breaking through a major realm takes rare treasures, a moment of \
         insight or a trial of life and death.\n\
         The higher the realm, the longer the lifespan and the wider the gap in strength.\n\
         </realms>\n\n",
    );

    prompt.push_str(&character_profile(character));
    prompt.push('\n');
    prompt.push_str(include_str!("prompts/narration.txt"));

    prompt
}

/// The character sheet, rendered from every field of the character.
pub fn character_profile(character: &Character) -> String {
    let vars = &character.variables;
    let mut profile = String::from("<character_profile>\n");

    profile.push_str("[Identity]\n");
    profile.push_str(&format!("- Name: {}\n", character.name));
    profile.push_str(&format!("- Gender: {}\n", character.gender.name()));
    profile.push_str(&format!("- Race: {}\n", character.race));
    profile.push_str(&format!("- Appearance: {}\n", character.appearance));
    profile.push_str(&format!("- Location: {}\n", character.location));
    profile.push_str(&format!("- Date: {}\n", character.date));

    profile.push_str("\n[Cultivation]\n");
    profile.push_str(&format!("- Realm: {}\n", vars.text("realm")));
    profile.push_str(&format!("- Lifespan: {} years\n", vars.text("lifespan")));
    profile.push_str(&format!("- Path: {}\n", character.path));
    profile.push_str(&format!("- Technique: {}\n", vars.text("technique")));
    profile.push_str(&format!("- Sect: {}\n", vars.text("sect")));

    profile.push_str("\n[Innate Gifts]\n");
    push_roll(&mut profile, "Physique", &character.physique);
    push_roll(&mut profile, "Comprehension", &character.comprehension);
    push_roll(&mut profile, "Relic", &character.relic);

    profile.push_str("\n[State]\n");
    for key in ["condition", "renown", "fortune", "charisma", "killing-intent", "currency"] {
        profile.push_str(&format!("- {key}: {}\n", vars.text(key)));
    }

    // Variables outside the standard vocabulary, e.g. from older saves.
    for (key, value) in vars.iter().filter(|(k, _)| !VARIABLE_KEYS.contains(k)) {
        profile.push_str(&format!("- {key}: {value}\n"));
    }

    profile.push_str("\n[Storage Pouch]\n");
    if character.inventory.is_empty() {
        profile.push_str("Empty\n");
    } else {
        profile.push_str(&character.inventory.join(", "));
        profile.push('\n');
    }

    profile.push_str("</character_profile>\n");
    profile
}

fn push_roll(out: &mut String, label: &str, roll: &AttributeRoll) {
    out.push_str(&format!(
        "- {label}: {} ({})\n  {}\n",
        roll.name,
        roll.grade.name(),
        roll.description
    ));
    if let Some(bonuses) = &roll.bonuses {
        for (key, value) in bonuses {
            out.push_str(&format!("  + {key}: {value}\n"));
        }
    }
}

/// The output format contract, with the character's current values as the
/// example block.
pub fn format_contract(character: &Character) -> String {
    let example: Map<String, Value> = EXAMPLE_KEYS
        .iter()
        .filter_map(|key| {
            let value = character.variables.get(key)?;
            serde_json::to_value(value).ok().map(|v| (key.to_string(), v))
        })
        .collect();

    include_str!("prompts/format_contract.txt")
        .replace("{example}", &Value::Object(example).to_string())
}
