//! Flow bookkeeping shared by the proxy servers

pub mod packet;
pub mod session;
pub mod session_provider;
pub mod uid;

pub use packet::{InterfaceOutput, IpPacket, PacketCodec};
pub use session::{Protocol, Session};
pub use session_provider::{SessionProvider, SessionStats};
pub use uid::{NetEntry, UidDumper, UidProvider};
