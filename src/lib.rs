#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildIoError, Result};

mod config;
pub use config::{BuildSettings, BuildSettingsBuilder, RepoAlias};

pub mod morphology;
pub use morphology::{BuildMode, Kind, Morphology};

pub mod source;
pub use source::{Source, SourceId, SourcePool};

mod loader;
pub use loader::{SourceLoader, Triple};

mod validate;
pub use validate::validate_cross_refs;

pub mod artifact;
pub use artifact::{Artifact, ArtifactGraph, ArtifactId};

pub mod resolver;

pub mod cachekey;
pub use cachekey::{BuildEnvironment, CacheId, CacheKeyComputer};

pub mod cache;
pub use cache::{CacheWriter, LocalArtifactCache, RemoteArtifactCache};

mod repo;
pub use repo::RepoCache;

pub mod staging;
pub use staging::StagingArea;

mod builder;
pub use builder::Builder;

pub mod report;
pub use report::{NullReporter, Reporter, StdoutReporter};

mod driver;
pub use driver::BuildDriver;
