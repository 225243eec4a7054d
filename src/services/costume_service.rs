use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::json;

use crate::config::Settings;
use crate::errors::{AssetError, Result};
use crate::models::{AssetKey, Costume, FileKind, FileSpec, Language, Server};
use crate::services::ApiClient;

/// Unity rips publish text assets with this extra extension; output files
/// drop it.
const PLATFORM_SUFFIX: &str = ".bytes";
const DEFAULT_TEXTURE_EXT: &str = ".png";
const BASE_BUNDLE_SUFFIX: &str = "_general";

#[derive(Clone, Debug, Deserialize)]
pub struct CharacterEntry {
    pub id: u32,
    /// Localized names ordered `[cn, en, jp, kr]`.
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CharacterDetail {
    pub id: u32,
    pub names: Vec<String>,
    #[serde(default)]
    pub skins: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CostumeEntry {
    pub name: String,
    pub id: u32,
    #[serde(default)]
    pub event: bool,
}

#[derive(Clone, Debug)]
pub struct CharacterHit {
    pub id: u32,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct BuildMetadata {
    model: Option<String>,
    physics: Option<String>,
    textures: Option<Vec<String>>,
    motions: Option<BTreeMap<String, Vec<String>>>,
    expressions: Option<Vec<String>>,
}

/// Translates loosely-typed remote metadata into the `Costume`/`FileSpec`
/// model and answers character/costume discovery queries.
#[derive(Clone)]
pub struct CostumeService {
    api: ApiClient,
    language: Language,
    match_threshold: u8,
}

impl CostumeService {
    pub fn new(api: ApiClient, settings: &Settings) -> Self {
        Self {
            api,
            language: settings.language,
            match_threshold: settings.match_threshold,
        }
    }

    pub async fn characters(&self) -> Result<Vec<CharacterEntry>> {
        self.api
            .get_json(&self.api.character_roster_url(), Some("characters"))
            .await
    }

    pub async fn character_detail(&self, id: u32) -> Result<CharacterDetail> {
        self.api
            .get_json(
                &self.api.character_detail_url(id),
                Some(&format!("character_{id}")),
            )
            .await
    }

    /// Fuzzy character lookup over the roster's localized names.
    pub async fn find_character(&self, query: &str) -> Result<CharacterHit> {
        let roster = self.characters().await?;
        match_character(&roster, query, self.language, self.match_threshold)
            .ok_or_else(|| AssetError::NoMatch(query.to_string()))
    }

    /// Costumes belonging to one character, base bundle excluded, live-event
    /// costumes sorted last (or dropped entirely).
    pub async fn costumes_for(
        &self,
        character_id: u32,
        include_events: bool,
    ) -> Result<Vec<CostumeEntry>> {
        let index: Vec<CostumeEntry> = self
            .api
            .get_json(&self.api.costume_index_url(), Some("costume_index"))
            .await?;
        Ok(filter_costumes(index, character_id, include_events))
    }

    /// Fetch and validate the costume's build-metadata document.
    pub async fn build_costume(&self, bundle: &str) -> Result<Costume> {
        let meta: BuildMetadata = self
            .api
            .get_json(
                &self.api.build_metadata_url(bundle),
                Some(&format!("build_{bundle}")),
            )
            .await?;
        costume_from_metadata(bundle, self.api.server(), meta)
    }

    /// Costume icon bytes, resolved through the asset index and served from
    /// the binary cache on repeat calls.
    pub async fn costume_icon(&self, bundle: &str) -> Result<Vec<u8>> {
        let index: BTreeMap<String, u32> = self
            .api
            .get_json(&self.api.asset_index_url(), Some("asset_index"))
            .await?;
        let id = index
            .get(bundle)
            .copied()
            .ok_or_else(|| AssetError::NotFound(format!("asset index entry for {bundle}")))?;
        let cache_key = format!("live2d/icons/{}/{}.png", self.api.server().slug(), id);
        self.api
            .get_bytes(&self.api.costume_icon_url(id), Some(&cache_key))
            .await
    }

    /// Manifest transform over the subset of file specs whose destinations
    /// exist on disk. Pure apart from the existence probes; identical
    /// present-file sets serialize byte-identically.
    pub fn render_model_json(costume: &Costume, model_dir: &Path) -> serde_json::Value {
        let mut model = None;
        let mut physics = None;
        let mut textures = Vec::new();
        let mut motions: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        let mut expressions = Vec::new();

        for spec in &costume.files {
            if !model_dir.join(&spec.dest).is_file() {
                continue;
            }
            match &spec.kind {
                FileKind::Model => model = Some(spec.dest.clone()),
                FileKind::Physics => physics = Some(spec.dest.clone()),
                FileKind::Texture => textures.push(json!(spec.dest)),
                FileKind::Motion(group) => motions.entry(group.clone()).or_default().push(json!({
                    "name": entry_name(&spec.dest),
                    "file": spec.dest,
                })),
                FileKind::Expression => expressions.push(json!({
                    "name": entry_name(&spec.dest),
                    "file": spec.dest,
                })),
            }
        }

        let mut doc = json!({
            "version": "1.0.0",
            "layout": {
                "center_x": 0.0,
                "center_y": 0.0,
                "width": 2.0,
            },
            "hit_areas_custom": {
                "head_x": [-0.35, 0.6],
                "head_y": [0.19, -0.2],
                "body_x": [-0.3, -0.25],
                "body_y": [0.3, -0.9],
            },
            "textures": textures,
            "motions": motions,
            "expressions": expressions,
        });
        if let Some(model) = model {
            doc["model"] = json!(model);
        }
        if let Some(physics) = physics {
            doc["physics"] = json!(physics);
        }
        doc
    }
}

fn localized_name(entry: &CharacterEntry, language: Language) -> Option<&str> {
    entry
        .names
        .get(language.name_index())
        .filter(|name| !name.is_empty())
        .or_else(|| entry.names.first())
        .map(String::as_str)
}

fn match_character(
    roster: &[CharacterEntry],
    query: &str,
    language: Language,
    threshold: u8,
) -> Option<CharacterHit> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    let mut best: Option<CharacterHit> = None;
    for entry in roster {
        let Some(name) = localized_name(entry, language) else {
            continue;
        };
        let score = rapidfuzz::fuzz::partial_ratio(needle.chars(), name.to_lowercase().chars());
        // strict comparison keeps the first-seen candidate on ties
        if best.as_ref().map(|hit| score > hit.score).unwrap_or(true) {
            best = Some(CharacterHit {
                id: entry.id,
                name: name.to_string(),
                score,
            });
        }
    }
    best.filter(|hit| hit.score >= threshold as f64)
}

fn filter_costumes(
    index: Vec<CostumeEntry>,
    character_id: u32,
    include_events: bool,
) -> Vec<CostumeEntry> {
    let prefix = format!("{character_id:03}_");
    let base = format!("{character_id:03}{BASE_BUNDLE_SUFFIX}");
    let mut list: Vec<CostumeEntry> = index
        .into_iter()
        .filter(|costume| costume.name.starts_with(&prefix))
        .filter(|costume| costume.name != base)
        .filter(|costume| include_events || !costume.event)
        .collect();
    list.sort_by(|a, b| {
        let left = (a.event, numeric_suffix(&a.name).unwrap_or(u32::MAX), &a.name);
        let right = (b.event, numeric_suffix(&b.name).unwrap_or(u32::MAX), &b.name);
        left.cmp(&right)
    });
    list
}

fn numeric_suffix(name: &str) -> Option<u32> {
    name.rsplit('_').next().and_then(|tail| tail.parse::<u32>().ok())
}

fn require<T>(value: Option<T>, section: &str) -> Result<T> {
    value.ok_or_else(|| AssetError::Parse(format!("required section missing: {section}")))
}

fn strip_platform_suffix(name: &str) -> &str {
    name.strip_suffix(PLATFORM_SUFFIX).unwrap_or(name)
}

fn texture_file_name(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{name}{DEFAULT_TEXTURE_EXT}")
    }
}

/// Manifest entry label: file name minus the expression and regular
/// extensions ("motions/angry01.mtn" → "angry01", "f01.exp.json" → "f01").
fn entry_name(dest: &str) -> String {
    let file = Path::new(dest)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(dest);
    let file = file.strip_suffix(".exp.json").unwrap_or(file);
    Path::new(file)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file)
        .to_string()
}

fn costume_from_metadata(bundle: &str, server: Server, meta: BuildMetadata) -> Result<Costume> {
    let model = require(meta.model, "model")?;
    let textures = require(meta.textures, "textures")?;
    let motions = require(meta.motions, "motions")?;
    let expressions = require(meta.expressions, "expressions")?;

    let key = |file: &str| AssetKey::new(bundle, file, server);
    let mut files = Vec::new();

    files.push(FileSpec {
        source: key(&model),
        dest: strip_platform_suffix(&model).to_string(),
        optional: false,
        kind: FileKind::Model,
    });

    // absent physics is normal; many costumes ship without it
    if let Some(physics) = meta.physics {
        files.push(FileSpec {
            source: key(&physics),
            dest: strip_platform_suffix(&physics).to_string(),
            optional: true,
            kind: FileKind::Physics,
        });
    }

    for texture in &textures {
        let name = texture_file_name(texture);
        files.push(FileSpec {
            source: key(&name),
            dest: format!("textures/{name}"),
            optional: false,
            kind: FileKind::Texture,
        });
    }

    for (group, names) in &motions {
        for name in names {
            files.push(FileSpec {
                source: key(name),
                dest: format!("motions/{}", strip_platform_suffix(name)),
                optional: false,
                kind: FileKind::Motion(group.clone()),
            });
        }
    }

    for name in &expressions {
        files.push(FileSpec {
            source: key(name),
            dest: format!("expressions/{}", strip_platform_suffix(name)),
            optional: false,
            kind: FileKind::Expression,
        });
    }

    Ok(Costume {
        name: bundle.to_string(),
        files,
    })
}
