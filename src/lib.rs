//! helm-chart-operator — a Kubernetes controller that reconciles HelmChart
//! custom resources into helm-runner Jobs and their supporting objects.

pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod leader_election;
