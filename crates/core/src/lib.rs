pub mod intent;
pub mod models;
pub mod policy;
pub mod refund;
pub mod reply;
pub mod search;
pub mod seats;
pub mod timeline;

pub use intent::{classify_intent_rules, detect_locale, needs_clarification, normalize_text};
pub use models::*;
pub use policy::{default_operators, describe_rules, PolicyError, SeedOperator};
pub use refund::{calculate_refund, hours_between, RefundError, CONVENIENCE_FEE_PERCENTAGE};
pub use reply::compose_chat_reply;
pub use search::{search_buses, BusOption, BusSearchQuery, SearchError};
pub use seats::{ensure_seat_available, is_valid_seat, seat_labels, seat_map, SeatError, SeatInfo};
pub use timeline::{advance_timeline, build_refund_timeline};
