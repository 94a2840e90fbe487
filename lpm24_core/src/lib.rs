pub mod constants;
pub mod entry;
pub mod errors;
pub mod groups;
pub mod handle_registry;
pub mod helpers;
pub mod qsbr;
pub mod rules;
pub mod telemetry;
pub mod types;
pub mod update;

use constants::*;
use helpers::*;
use crate::errors::Error;
use crate::groups::{GroupPool, Tables};
use crate::rules::{RuleAdd, RuleStore};
use crate::update::Cover;
use ipnet::Ipv4Net;
use log::{debug, info, trace, warn};
use metrics::counter;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, MutexGuard};

pub use crate::qsbr::{DeferQueue, Qsbr, QsbrReader};
pub use crate::types::{AddOutcome, LpmConfig, LpmStats, RcuConfig, ReclaimMode};

/// Everything only the writer touches.
struct Writer {
    rules: RuleStore,
    pool: GroupPool,
}

/// An IPv4 longest-prefix-match table.
///
/// Lookups are lock-free and may run on any number of threads while one
/// writer adds or deletes rules. Writers are serialised internally; a table
/// is normally shared as `Arc<LpmTable>`.
pub struct LpmTable {
    name: String,
    config: LpmConfig,
    tables: Tables,
    writer: Mutex<Writer>,
}

impl LpmTable {
    // ---- logging bootstraper -------------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Build a table without registering its name.
    pub fn new(name: &str, config: LpmConfig) -> Result<Self, Error> {
        Self::ensure_logging();
        telemetry::init();

        if name.is_empty() || name.len() > NAME_SIZE {
            return Err(Error::InvalidArgument("table name must be 1..=32 bytes"));
        }
        if config.max_rules == 0 {
            return Err(Error::InvalidArgument("max_rules must be non-zero"));
        }
        if config.number_groups > MAX_TBL8_NUM_GROUPS {
            return Err(Error::InvalidArgument("number_groups exceeds 2^24"));
        }

        info!(
            "[CREATE] table '{}' max_rules={} number_groups={}",
            name, config.max_rules, config.number_groups
        );
        Ok(Self {
            name: name.to_owned(),
            config,
            tables: Tables::new(config.number_groups),
            writer: Mutex::new(Writer {
                rules: RuleStore::new(config.max_rules),
                pool: GroupPool::new(),
            }),
        })
    }

    /// Build a table and make it reachable through [`LpmTable::find_existing`].
    pub fn create(name: &str, config: LpmConfig) -> Result<Arc<Self>, Error> {
        // Fail fast before allocating 64 MiB for a name that is taken.
        if handle_registry::contains(name) {
            warn!("[CREATE] table '{}' already exists", name);
            return Err(Error::AlreadyExists);
        }
        let table = Arc::new(Self::new(name, config)?);
        handle_registry::register(Arc::clone(&table))?;
        Ok(table)
    }

    pub fn find_existing(name: &str) -> Result<Arc<Self>, Error> {
        handle_registry::find(name).ok_or(Error::NotFound)
    }

    /// Unregister the table and settle pending reclamation. Memory goes
    /// away with the last outstanding handle.
    pub fn free(self: Arc<Self>) {
        if handle_registry::unregister(&self) {
            debug!("[FREE] '{}' removed from registry", self.name);
        }
        match self.writer() {
            Ok(mut w) => {
                let drained = w.pool.drain(&self.tables);
                info!("[FREE] table '{}' freed ({} pending groups settled)", self.name, drained);
            }
            Err(e) => warn!("[FREE] table '{}': {}", self.name, e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn writer(&self) -> Result<MutexGuard<'_, Writer>, Error> {
        self.writer
            .lock()
            .map_err(|e| Error::Lock(format!("writer lock poisoned: {e}")))
    }

    fn check_depth(depth: u8) -> Result<(), Error> {
        if valid_depth(depth) {
            Ok(())
        } else {
            Err(Error::InvalidArgument("depth must be in 1..=32"))
        }
    }

    /// Attach a reclamation scheme. Without one, released groups are reused
    /// at once, which is only safe if no reader runs concurrently with
    /// deletes.
    pub fn bind_reclamation(&self, cfg: RcuConfig) -> Result<(), Error> {
        let mut w = self.writer()?;
        w.pool.bind(cfg, self.config.number_groups)
    }

    /// Add `ip/depth -> next_hop`, or change the next hop of an existing
    /// rule.
    pub fn add(&self, ip: u32, depth: u8, next_hop: u32) -> Result<AddOutcome, Error> {
        Self::check_depth(depth)?;
        if next_hop > MAX_NEXT_HOP {
            return Err(Error::InvalidArgument("next hop exceeds 24 bits"));
        }
        let ip_masked = canonical(ip, depth);

        let mut w = self.writer()?;
        let Writer { rules, pool } = &mut *w;

        let added = rules.add(ip_masked, depth, next_hop).inspect_err(|_| {
            warn!("[ADD] rule store full ({} rules)", rules.capacity());
        })?;
        let outcome = match added {
            RuleAdd::Unchanged => {
                trace!("[ADD] {:#010x}/{} -> {} already present", ip_masked, depth, next_hop);
                return Ok(AddOutcome::Unchanged);
            }
            RuleAdd::Inserted(_) => AddOutcome::Inserted,
            RuleAdd::Updated { .. } => AddOutcome::Updated,
        };

        if depth <= MAX_DEPTH_TBL24 {
            update::add_depth_small(&self.tables, ip_masked, depth, next_hop);
        } else if let Err(e) = update::add_depth_big(&self.tables, pool, ip_masked, depth, next_hop)
        {
            // Keep the rule store in step with what lookups can see.
            match added {
                RuleAdd::Inserted(index) => rules.delete(index, depth),
                RuleAdd::Updated {
                    index,
                    previous_next_hop,
                } => rules.restore_next_hop(index, previous_next_hop),
                RuleAdd::Unchanged => {}
            }
            warn!("[ADD] {:#010x}/{} rolled back: {}", ip_masked, depth, e);
            return Err(e);
        }

        if outcome == AddOutcome::Inserted {
            counter!("lpm_rules_added_total").increment(1);
        }
        debug!(
            "[ADD] {:#010x}/{} -> {} ({:?}, {} rules)",
            ip_masked,
            depth,
            next_hop,
            outcome,
            rules.len()
        );
        Ok(outcome)
    }

    /// Remove `ip/depth`. Addresses it covered fall back to the next most
    /// specific rule.
    ///
    /// `ReclamationUnavailable` means the rule is gone but its extension
    /// group could not be queued yet; a later delete or [`LpmTable::reclaim`]
    /// picks it up.
    pub fn delete(&self, ip: u32, depth: u8) -> Result<(), Error> {
        Self::check_depth(depth)?;
        let ip_masked = canonical(ip, depth);

        let mut w = self.writer()?;
        let Writer { rules, pool } = &mut *w;

        let index = rules.find(ip_masked, depth).ok_or(Error::NotFound)?;
        rules.delete(index, depth);
        counter!("lpm_rules_deleted_total").increment(1);

        let cover = rules.find_covering(ip_masked, depth).map(|(i, d)| Cover {
            depth: d,
            next_hop: rules.get(i).next_hop,
        });
        debug!(
            "[DELETE] {:#010x}/{} (cover: {:?}, {} rules left)",
            ip_masked,
            depth,
            cover,
            rules.len()
        );

        if depth <= MAX_DEPTH_TBL24 {
            update::delete_depth_small(&self.tables, ip_masked, depth, cover);
            Ok(())
        } else {
            update::delete_depth_big(&self.tables, pool, ip_masked, depth, cover)
        }
    }

    /// Drop every rule and return the table to its freshly created state.
    pub fn delete_all(&self) -> Result<(), Error> {
        let mut w = self.writer()?;
        if w.rules.is_empty() {
            debug!("[CLEAR] table '{}' holds no rules", self.name);
        }
        let removed = w.rules.len();
        w.rules.clear();
        // Level 1 first: once no pointer is reachable the groups can be wiped.
        self.tables.clear_tbl24();
        w.pool.reset(&self.tables);
        info!("[CLEAR] table '{}' cleared ({} rules removed)", self.name, removed);
        Ok(())
    }

    /// Next hop of the exact rule `ip/depth`, if stored.
    pub fn is_rule_present(&self, ip: u32, depth: u8) -> Result<Option<u32>, Error> {
        Self::check_depth(depth)?;
        let ip_masked = canonical(ip, depth);
        let w = self.writer()?;
        Ok(w.rules
            .find(ip_masked, depth)
            .map(|i| w.rules.get(i).next_hop))
    }

    /// Longest-prefix match for `ip`. Never blocks.
    #[inline]
    pub fn lookup(&self, ip: u32) -> Option<u32> {
        self.tables.lookup(ip)
    }

    /// Look up `ips[i]` into `out[i]` for the shorter of the two slices.
    pub fn lookup_bulk(&self, ips: &[u32], out: &mut [Option<u32>]) {
        for (ip, slot) in ips.iter().zip(out.iter_mut()) {
            *slot = self.tables.lookup(*ip);
        }
    }

    pub fn add_net(&self, net: Ipv4Net, next_hop: u32) -> Result<AddOutcome, Error> {
        self.add(u32::from(net.network()), net.prefix_len(), next_hop)
    }

    pub fn delete_net(&self, net: Ipv4Net) -> Result<(), Error> {
        self.delete(u32::from(net.network()), net.prefix_len())
    }

    /// Run one batch reclaim over the defer queue; returns the groups freed.
    pub fn reclaim(&self) -> Result<u32, Error> {
        let mut w = self.writer()?;
        Ok(w.pool.reclaim(&self.tables))
    }

    pub fn stats(&self) -> Result<LpmStats, Error> {
        let w = self.writer()?;
        Ok(LpmStats {
            rules: w.rules.len(),
            max_rules: self.config.max_rules,
            groups_in_use: w.pool.in_use(),
            number_groups: self.config.number_groups,
            pending_reclaims: w.pool.pending(),
        })
    }

    pub fn rule_count(&self) -> Result<u32, Error> {
        Ok(self.writer()?.rules.len())
    }

    pub fn free_groups(&self) -> Result<u32, Error> {
        Ok(self.config.number_groups - self.writer()?.pool.in_use())
    }

    /// `(prefix, depth, next_hop)` of every rule, shallowest first.
    pub fn rules(&self) -> Result<Vec<(u32, u8, u32)>, Error> {
        Ok(self.writer()?.rules.iter().collect())
    }
}

// Public module for C API functions
pub mod public_api;

// Re-export all public API functions at the crate root
pub use public_api::*;
