//! # k2-client
//!
//! SysEx client for Kurzweil K2000/K2500/K2600 synthesizers.
//!
//! Drives the instrument remotely over MIDI: presses front-panel buttons,
//! reads the text and graphics layers of its display, and fetches, caches and
//! writes back the objects (programs, setups, effects, …) stored on it.
//!
//! ## Architecture
//!
//! - **Frames** ([`protocol`]): SysEx framing, checksums, 7-bit field and
//!   data encodings, stream reassembly
//! - **Messages** ([`message`]): the closed set of K2 commands and replies
//! - **Dispatch** ([`dispatch`]): reply correlation and chunked transfers
//! - **Session** ([`Session`]): background read loop and writer task over
//!   any async byte stream, with the public navigation and data operations
//!
//! ## Example
//!
//! ```ignore
//! use k2_client::{ObjectKind, Session};
//!
//! #[tokio::main]
//! async fn main() -> k2_client::Result<()> {
//!     let session = Session::builder()
//!         .call_timeout(std::time::Duration::from_secs(2))
//!         .connect("K2600")
//!         .await?;
//!
//!     let grid = session.screen_text().await?;
//!     println!("{}", grid);
//!
//!     let tenor = session.catalog().get(ObjectKind::Program, 125).await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod error;
pub mod message;
pub mod protocol;
pub mod transport;
pub mod writer;

mod session;

pub use catalog::{CatalogHandle, CatalogSnapshot, ObjectCatalog, ObjectEntry};
pub use config::SessionConfig;
pub use dispatch::{CorrelationKey, DeviceEvent, ReassemblyMode};
pub use display::{Raster, ScreenState, TextGrid};
pub use error::{K2Error, Result};
pub use message::{Button, Direction, Message, ObjectAddress, ObjectKind};
pub use session::{Session, SessionBuilder, SessionStats};
