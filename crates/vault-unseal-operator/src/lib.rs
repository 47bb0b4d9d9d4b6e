pub mod crds {
    pub mod unseal_config;
}
pub mod config;
pub mod error;
pub mod pod_mapper;
pub mod pool;
pub mod processor;
pub mod reconciler;
pub mod repository;
pub mod store;
pub mod unseal_controller;
pub mod vault;
