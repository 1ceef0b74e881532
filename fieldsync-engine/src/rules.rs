//! Default invalidation rules for field-operations data.
//!
//! Every change that moves stock lists every view that reads stock:
//! warehouse aggregates, allocation targets, low-stock alerts, per-project
//! allocations and orders.

use fieldsync_cache::InvalidationRule;
use fieldsync_core::KeyPrefix;

pub const MATERIALS: &str = "materials";
pub const ALLOCATIONS: &str = "allocations";
pub const MATERIAL_ORDERS: &str = "material-orders";
pub const PROJECTS: &str = "projects";
pub const WORK_ENTRIES: &str = "work-entries";
pub const HOUSES: &str = "houses";
pub const APPOINTMENTS: &str = "appointments";
pub const CREWS: &str = "crews";
pub const TEAMS: &str = "teams";
pub const USERS: &str = "users";
pub const NOTIFICATIONS: &str = "notifications";

fn domain(name: &str) -> KeyPrefix {
    KeyPrefix::new(name)
}

fn view(name: &str, qualifier: &str) -> KeyPrefix {
    KeyPrefix::new(name).with(qualifier)
}

fn stock_views() -> Vec<KeyPrefix> {
    vec![
        view(MATERIALS, "warehouse"),
        view(MATERIALS, "unified-warehouse"),
        view(MATERIALS, "allocation-targets"),
        view(MATERIALS, "low-stock"),
    ]
}

pub fn default_rules() -> Vec<InvalidationRule> {
    let mut materials = stock_views();
    materials.extend([domain(ALLOCATIONS), domain(MATERIAL_ORDERS)]);

    let mut allocations = vec![domain(MATERIALS)];
    allocations.extend(stock_views());
    allocations.push(domain(PROJECTS));

    let mut orders = vec![domain(MATERIALS)];
    orders.extend(stock_views());
    orders.push(domain(ALLOCATIONS));

    vec![
        InvalidationRule::new(domain(MATERIALS), materials),
        InvalidationRule::new(domain(ALLOCATIONS), allocations),
        InvalidationRule::new(domain(MATERIAL_ORDERS), orders),
        InvalidationRule::new(domain(WORK_ENTRIES), [domain(PROJECTS)]),
        InvalidationRule::new(domain(HOUSES), [domain(PROJECTS)]),
        InvalidationRule::new(domain(PROJECTS), []),
        InvalidationRule::new(domain(APPOINTMENTS), []),
        InvalidationRule::new(domain(CREWS), [domain(TEAMS)]),
        InvalidationRule::new(domain(TEAMS), [domain(CREWS), domain(USERS)]),
        InvalidationRule::new(domain(USERS), []),
        InvalidationRule::new(domain(NOTIFICATIONS), []),
    ]
}
