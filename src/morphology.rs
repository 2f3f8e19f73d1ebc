//! The recipe ("morphology") data model.
//!
//! A morphology is a declarative JSON document describing either a chunk
//! (one built package), a stratum (a named layer of chunks) or a system
//! (a bootable image composed of strata). Parsing is strict about the
//! `kind` discriminator and lenient about optional lists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of recipe, also the kind of the artifact it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Chunk,
    Stratum,
    System,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chunk => "chunk",
            Self::Stratum => "stratum",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// A parsed recipe document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Morphology {
    Chunk(ChunkMorphology),
    Stratum(StratumMorphology),
    System(SystemMorphology),
}

impl Morphology {
    /// Parses a recipe from its JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> Kind {
        match self {
            Self::Chunk(_) => Kind::Chunk,
            Self::Stratum(_) => Kind::Stratum,
            Self::System(_) => Kind::System,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Chunk(m) => &m.name,
            Self::Stratum(m) => &m.name,
            Self::System(m) => &m.name,
        }
    }

    /// Whether the caches must mirror a sidecar metadata blob alongside
    /// the artifact built from this recipe.
    pub fn needs_artifact_metadata_cached(&self) -> bool {
        match self {
            Self::Chunk(m) => m.needs_artifact_metadata_cached,
            Self::Stratum(m) => m.needs_artifact_metadata_cached,
            Self::System(m) => m.needs_artifact_metadata_cached,
        }
    }

    /// The recipe normalized for hashing: sorted keys, compact form.
    pub fn canonical_value(&self) -> serde_json::Value {
        // Value maps are BTreeMaps, so key order is canonical already.
        serde_json::to_value(self).expect("morphology serialization is infallible")
    }
}

/// A single built package and the command lists that produce it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkMorphology {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub configure_commands: Vec<String>,
    #[serde(default)]
    pub build_commands: Vec<String>,
    #[serde(default)]
    pub test_commands: Vec<String>,
    #[serde(default)]
    pub install_commands: Vec<String>,
    #[serde(default)]
    pub needs_artifact_metadata_cached: bool,
}

/// A named layer of chunks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StratumMorphology {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Other strata that must be built before any chunk of this one.
    #[serde(default)]
    pub build_depends: Vec<StratumSpec>,
    /// The chunks of this stratum, in build order.
    #[serde(default)]
    pub chunks: Vec<ChunkSpec>,
    #[serde(default)]
    pub needs_artifact_metadata_cached: bool,
}

/// A bootable image composed of strata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemMorphology {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Target CPU architecture identifier.
    pub arch: String,
    pub strata: Vec<StratumSpec>,
    #[serde(default)]
    pub needs_artifact_metadata_cached: bool,
}

/// A reference to a stratum recipe, from a system or from `build-depends`.
///
/// `repo` and `ref` may be omitted, in which case they are inherited from
/// the referencing recipe's source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StratumSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub morph: String,
}

/// A reference to a chunk recipe within a stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub morph: String,
    /// How the chunk is built and installed, see [`BuildMode`].
    #[serde(default = "default_build_mode")]
    pub build_mode: String,
    /// Installation prefix exported to the build commands as `PREFIX`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

pub(crate) fn default_build_mode() -> String {
    "staging".to_string()
}

pub(crate) fn default_prefix() -> String {
    "/usr".to_string()
}

/// The recognized chunk build modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Built with tooling from outside the target; installed into staging
    /// areas only for chunks of the same stratum.
    Bootstrap,
    /// Built inside a chroot of the staging area, with mounts set up.
    Staging,
    /// Built like staging but without the chroot.
    Test,
}

impl BuildMode {
    /// Maps a raw `build-mode` string to a mode.
    ///
    /// Unknown modes are not fatal: a warning is logged and the chunk is
    /// treated as a staging build.
    pub fn parse_lenient(raw: &str, chunk_name: &str) -> Self {
        match raw {
            "bootstrap" => Self::Bootstrap,
            "staging" => Self::Staging,
            "test" => Self::Test,
            other => {
                warn!(
                    "unknown build mode {other} for chunk {chunk_name}, \
                     defaulting to staging mode"
                );
                Self::Staging
            }
        }
    }
}
