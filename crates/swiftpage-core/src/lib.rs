//! # SwiftPage Core
//!
//! Core types shared by every layer of the SwiftPage rewrite engine.
//!
//! This crate provides the foundational building blocks used throughout
//! the workspace:
//!
//! - Error kinds for the rewrite pipeline ([`RewriteErrorKind`]) and a
//!   crate-level [`Error`]
//! - Pluggable content hashing ([`Hasher`], [`Sha256Hasher`], [`MockHasher`])
//! - The rewritten-URL codec ([`ResourceNamer`], [`RewrittenUrl`])
//! - Content types keyed by extension ([`ContentType`])
//! - Clocks ([`Timer`], [`SystemTimer`], [`MockTimer`])
//! - URL wildcards and the [`DomainLawyer`]
//! - Rewrite configuration ([`RewriteOptions`])
//! - Per-request structured logging ([`LogRecord`]) and device classes
//!
//! ## Example
//!
//! ```rust
//! use swiftpage_core::{Hasher, MockHasher, ResourceNamer};
//!
//! let hasher = MockHasher::new();
//! let hash = hasher.hash(b"*{display:none}");
//! let namer = ResourceNamer::new("cf", hash, vec!["a.css".to_string()], "css");
//! let leaf = namer.encode().unwrap();
//! assert_eq!(ResourceNamer::decode(&leaf, 32).unwrap(), namer);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod content_type;
pub mod device;
pub mod domain_lawyer;
pub mod error;
pub mod hasher;
pub mod log_record;
pub mod namer;
pub mod options;
pub mod timer;
pub mod wildcard;

pub use content_type::{ContentKind, ContentType};
pub use device::{DeviceClass, DeviceClassifier, UserAgentClassifier};
pub use domain_lawyer::{DomainLawyer, DomainLawyerConfig, DomainMapping, ProxyMapping};
pub use error::{Error, Result, RewriteErrorKind};
pub use hasher::{Hasher, MockHasher, Sha256Hasher};
pub use log_record::{LogRecord, RewriterInfo, RewriterStatus, TimingInfo, REQUEST_LOG_TARGET};
pub use namer::{is_rewritten_url, ResourceNamer, RewrittenUrl, PAGESPEED_MARKER};
pub use options::RewriteOptions;
pub use timer::{MockTimer, SystemTimer, Timer, TimestampMs};
pub use wildcard::{Wildcard, WildcardGroup};
