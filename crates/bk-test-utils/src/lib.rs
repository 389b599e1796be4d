pub mod mock_director;
pub mod mock_ws_client;

pub use mock_director::MockDirectorServer;
pub use mock_ws_client::MockWsClient;
