//! # impulse-protocol
//!
//! Value objects and the transport record for the Impulse message bus.
//!
//! This crate has no runtime: it defines the pieces an impulse is made of and
//! how an impulse travels between processes.
//!
//! - `Frequency` / `FrequencyCollection` - (entity, channel) routes
//! - `Emitter` - identity of the logical sender
//! - `ImpulseRecord` - transport form, imported through a typed schema
//! - `codec` - length-prefixed MessagePack framing of records
//! - `hash` - SHA-256 content hashing for ids
//!
//! ## Example
//!
//! ```rust
//! use impulse_protocol::{codec, Frequency, ImpulseRecord};
//!
//! let mut record = ImpulseRecord::default();
//! record.info.frequencies.add(Frequency::new("app", "events"));
//!
//! let encoded = codec::encode(&record).unwrap();
//! let (decoded, report) = codec::decode(&encoded).unwrap();
//! assert!(report.is_clean());
//! assert_eq!(decoded, record);
//! ```

pub mod codec;
pub mod emitter;
pub mod frequency;
pub mod hash;
pub mod record;

pub use codec::{decode, encode, CodecError};
pub use emitter::{Emitter, EmitterError};
pub use frequency::{Frequency, FrequencyCollection};
pub use record::{
    FieldOutcome, ImportReport, ImpulseRecord, InfoRecord, OptionsRecord, RecordError, ReplyLink,
    ValueKind, Verdict,
};
