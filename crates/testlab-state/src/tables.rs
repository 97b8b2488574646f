//! redb table definitions for the lab state store.
//!
//! Record tables use `u64` id keys and `&[u8]` values (JSON-serialized
//! domain types). Ids are allocated from the `counters` table.

use redb::TableDefinition;

pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

/// Host queue entries.
pub const QUEUE_ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("queue_entries");

pub const SPECIAL_TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("special_tasks");

pub const LABELS: TableDefinition<u64, &[u8]> = TableDefinition::new("labels");

pub const ACL_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("acl_groups");

/// Last allocated id per record table, keyed by table name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
