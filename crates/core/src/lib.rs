//! RTSP server for H.264 video.
//!
//! Streams a file or pipe in real time, or relays a live publisher that
//! connects with ANNOUNCE/RECORD, to any number of readers over UDP, TCP
//! interleaved, or multicast.
//!
//! ```no_run
//! use std::path::Path;
//! use vidcast::{Server, ServerConfig, SourceConfig};
//!
//! let mut server = Server::new(ServerConfig::default());
//! server.start()?;
//! let pacing = server.publish_file(Path::new("clip.ts"), &SourceConfig::default())?;
//! let _ = pacing.join();
//! # Ok::<(), vidcast::RtspError>(())
//! ```

pub mod error;
pub mod media;
pub mod pacing;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod stream;
pub mod transport;

pub use error::{Result, RtspError};
pub use media::Packetizer;
pub use media::params::{H264Parameters, ParameterExtractor, ScanLimits};
pub use server::{Server, ServerConfig};
pub use source::transcode::MediaTools;
pub use source::{SourceConfig, SourceReader};
pub use stream::{SharedStream, StreamDescription, StreamHandle};
pub use transport::MulticastConfig;
