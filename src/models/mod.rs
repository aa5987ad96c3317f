pub mod backend;
pub mod k8s;
