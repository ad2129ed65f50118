pub mod dispatcher;
pub mod driver;
pub mod instance_client;
pub mod jobs;
pub mod pool;
