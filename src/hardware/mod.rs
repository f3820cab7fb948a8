pub mod command_proxy;

pub use command_proxy::CommandProxyClient;
