//! Everything stored under a node: resource lists, machines, dashboards.

pub mod alarm;
pub mod dashboard;
pub mod machine;
pub mod resource;

pub use self::dashboard::Dashboard;
pub use self::dashboard::DashboardService;
pub use self::dashboard::Panel;
pub use self::dashboard::Target;
pub use self::machine::MachineController;
pub use self::resource::ResourceService;
pub use self::resource::SearchResult;
