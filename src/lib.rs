// A federation broker sits in front of many independent registries and
// aggregates and makes them look like one. Names are hierarchical, and each
// authority owns the subtree below its own name. The registry broker answers
// for the authorities it hosts and forwards everything else to the owning
// peer. The slice broker fans every resource operation out to all known
// aggregates and merges whatever comes back; an aggregate that fails only
// shows up as a diagnostic entry next to the merged answer.
//
// Shared state is limited to a TTL cache for read-mostly answers and a ledger
// of call ids used to make client retries idempotent. Both are created once
// at startup and handed to the brokers by reference.
pub mod broker;
