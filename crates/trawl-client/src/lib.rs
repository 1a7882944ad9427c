pub mod history;
pub mod sink;
pub mod transport;

pub use history::JsonFileHistory;
pub use sink::FileSink;
pub use transport::ReqwestTransport;
