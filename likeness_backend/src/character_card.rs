//! Character profile import from common card formats.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// TavernAI Character Card V2 format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TavernAICardV2 {
    data: TavernAIData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TavernAIData {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    personality: String,
    #[serde(default)]
    scenario: String,
    #[serde(default)]
    first_mes: String,
    #[serde(default)]
    system_prompt: String,
}

/// The character the engine speaks and draws as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Physical description; grounds the locked visual attributes.
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub first_message: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFormat {
    TavernAiV2,
    TavernAiV2Png,
    Wpp,
    Boostyle,
}

impl CardFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CardFormat::TavernAiV2 => "tavernai_v2",
            CardFormat::TavernAiV2Png => "tavernai_v2_png",
            CardFormat::Wpp => "wpp",
            CardFormat::Boostyle => "boostyle",
        }
    }
}

/// Load a character card from disk. The profile id is the file stem.
pub fn load_character_card<P: AsRef<Path>>(path: P) -> Result<(CharacterProfile, CardFormat)> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read character card from {:?}", path))?;
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(slug)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "character".to_string());
    parse_character_card(&id, &bytes)
}

/// Parse card bytes: PNG with an embedded `chara` chunk, TavernAI V2 JSON,
/// W++ or Boostyle text, tried in that order.
pub fn parse_character_card(id: &str, bytes: &[u8]) -> Result<(CharacterProfile, CardFormat)> {
    if bytes.starts_with(PNG_SIGNATURE) {
        let encoded = extract_png_text_chunk(bytes, "chara")
            .context("Failed to find 'chara' tEXt chunk in PNG")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("Failed to decode base64 character data")?;
        let json = String::from_utf8(decoded).context("Character data is not valid UTF-8")?;
        return Ok((parse_tavernai_v2(id, &json)?, CardFormat::TavernAiV2Png));
    }

    let content = std::str::from_utf8(bytes).context("Character card is not valid UTF-8")?;

    if let Ok(profile) = parse_tavernai_v2(id, content) {
        return Ok((profile, CardFormat::TavernAiV2));
    }
    if let Ok(profile) = parse_wpp_format(id, content) {
        return Ok((profile, CardFormat::Wpp));
    }
    if let Ok(profile) = parse_boostyle_format(id, content) {
        return Ok((profile, CardFormat::Boostyle));
    }

    anyhow::bail!("Unable to parse character card - unknown or unsupported format")
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Find a tEXt chunk by keyword.
pub(crate) fn extract_png_text_chunk(png_bytes: &[u8], keyword: &str) -> Result<String> {
    let mut pos = PNG_SIGNATURE.len();

    while pos + 12 <= png_bytes.len() {
        let length = u32::from_be_bytes([
            png_bytes[pos],
            png_bytes[pos + 1],
            png_bytes[pos + 2],
            png_bytes[pos + 3],
        ]) as usize;
        let chunk_type = &png_bytes[pos + 4..pos + 8];
        let data_end = pos + 8 + length;
        if data_end + 4 > png_bytes.len() {
            anyhow::bail!("Truncated PNG chunk at offset {}", pos);
        }

        if chunk_type == b"tEXt" {
            // keyword\0text
            let chunk_data = &png_bytes[pos + 8..data_end];
            if let Some(null_pos) = chunk_data.iter().position(|&b| b == 0) {
                if &chunk_data[..null_pos] == keyword.as_bytes() {
                    return String::from_utf8(chunk_data[null_pos + 1..].to_vec())
                        .context("tEXt chunk data is not valid UTF-8");
                }
            }
        }

        if chunk_type == b"IEND" {
            break;
        }
        // length + type + data + CRC
        pos = data_end + 4;
    }

    anyhow::bail!("PNG tEXt chunk with keyword '{}' not found", keyword)
}

fn parse_tavernai_v2(id: &str, content: &str) -> Result<CharacterProfile> {
    let card: TavernAICardV2 =
        serde_json::from_str(content).context("Failed to parse as TavernAI V2 JSON")?;
    let data = card.data;
    if data.name.trim().is_empty() {
        anyhow::bail!("TavernAI card has no name");
    }
    let appearance = appearance_from_text(&data.description).unwrap_or_else(|| data.description.clone());

    Ok(CharacterProfile {
        id: id.to_string(),
        name: data.name.trim().to_string(),
        description: data.description,
        appearance,
        personality: data.personality,
        scenario: data.scenario,
        first_message: data.first_mes,
        system_prompt: data.system_prompt,
    })
}

/// Values of a W++ attribute: `Name("a" + "b")` or `Name("a", "b")`.
fn wpp_values(content: &str, attribute: &str) -> Vec<String> {
    let marker = format!("{}(", attribute);
    let Some(start) = content.find(&marker) else {
        return Vec::new();
    };
    let after = &content[start + marker.len()..];
    let Some(end) = after.find(')') else {
        return Vec::new();
    };
    after[..end]
        .split([',', '+'])
        .map(|s| s.trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// W++: `[character("Alice"){ Appearance("tall" + "blue eyes") ... }]`
fn parse_wpp_format(id: &str, content: &str) -> Result<CharacterProfile> {
    let name = wpp_values(content, "character")
        .into_iter()
        .next()
        .unwrap_or_default();
    if name.is_empty() {
        anyhow::bail!("W++ format parsing failed: no character name found");
    }

    let personality = wpp_values(content, "Personality");
    let mind = wpp_values(content, "Mind");
    let mut appearance = wpp_values(content, "Appearance");
    appearance.extend(wpp_values(content, "Body"));
    appearance.extend(wpp_values(content, "Features"));

    let mut traits = personality;
    traits.extend(mind);

    Ok(CharacterProfile {
        id: id.to_string(),
        name,
        description: wpp_values(content, "Description").join(", "),
        appearance: appearance.join(", "),
        personality: traits.join(", "),
        scenario: String::new(),
        first_message: String::new(),
        system_prompt: String::new(),
    })
}

/// Boostyle: plain text with labelled lines.
fn parse_boostyle_format(id: &str, content: &str) -> Result<CharacterProfile> {
    let mut profile = CharacterProfile {
        id: id.to_string(),
        name: String::new(),
        description: String::new(),
        appearance: String::new(),
        personality: String::new(),
        scenario: String::new(),
        first_message: String::new(),
        system_prompt: String::new(),
    };

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match label.trim().to_ascii_lowercase().as_str() {
            "name" => profile.name = value,
            "personality" => profile.personality = value,
            "description" => profile.description = value,
            "appearance" | "looks" => profile.appearance = value,
            "scenario" => profile.scenario = value,
            "first message" | "greeting" => profile.first_message = value,
            _ => {}
        }
    }

    if profile.name.is_empty() {
        anyhow::bail!("Boostyle format parsing failed: no name found");
    }
    if profile.appearance.is_empty() {
        profile.appearance = profile.description.clone();
    }
    Ok(profile)
}

/// Pull an embedded appearance section out of free text, either W++
/// `Appearance(...)` or an `Appearance:` line.
fn appearance_from_text(text: &str) -> Option<String> {
    let wpp = wpp_values(text, "Appearance");
    if !wpp.is_empty() {
        return Some(wpp.join(", "));
    }
    text.lines()
        .map(str::trim)
        .find_map(|line| {
            let (label, value) = line.split_once(':')?;
            label
                .trim()
                .eq_ignore_ascii_case("appearance")
                .then(|| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn slug(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// System prompt the character replies under.
pub fn character_to_system_prompt(character: &CharacterProfile) -> String {
    let mut parts = Vec::new();

    if !character.system_prompt.is_empty() {
        parts.push(character.system_prompt.clone());
    } else {
        parts.push(format!(
            "You are {}. Stay in character and reply as {} would, in first person.",
            character.name, character.name
        ));
    }

    if !character.description.is_empty() {
        parts.push(character.description.clone());
    }

    if !character.appearance.is_empty() && character.appearance != character.description {
        parts.push(format!("Your appearance: {}", character.appearance));
    }

    if !character.personality.is_empty() {
        parts.push(format!("Your personality: {}", character.personality));
    }

    if !character.scenario.is_empty() {
        parts.push(format!("Context: {}", character.scenario));
    }

    parts.push(
        "You are an adult. You can step away from the conversation and come back later, \
         like a real person would."
            .to_string(),
    );

    parts.join("\n\n")
}
