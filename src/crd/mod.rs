pub mod helm_chart;
pub mod helm_chart_config;

pub use helm_chart::{
    HelmChart, HelmChartCondition, HelmChartConditionType, HelmChartSpec, HelmChartStatus,
    SecretSpec,
};
pub use helm_chart_config::{HelmChartConfig, HelmChartConfigSpec};
