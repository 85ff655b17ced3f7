pub mod stream;
pub mod traits;
pub mod udp;

pub use stream::{connect_tcp, open_serial, stream_link};
pub use traits::{Link, LinkReader, LinkWriter};
pub use udp::bind_udp;
