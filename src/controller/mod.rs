pub mod apply;
pub mod child_resources;
pub mod helm_chart;
pub mod helpers;
