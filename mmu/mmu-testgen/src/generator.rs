//! # Run driver
//!
//! A [`Generator`] owns one run: it validates the [`Config`], expands the
//! templates, and builds every request against a single [`AddressPool`].
//!
//! Two draw streams are used. The main stream (seeded with the run seed)
//! drives expansion and placement; a separate injector stream drives error
//! injection, so that enabling errors does not move any address.

use crate::builder::{BuildError, Builder};
use crate::case::{GeneratedCase, GenerationReport, RequestFailure};
use crate::error::{GenerationError, Space, SpecError, SpecPosition};
use crate::expand::{Request, expand};
use crate::inject::inject;
use crate::pool::{AddressConstraint, AddressPool, Purpose, Transaction};
use crate::random::RandomDraws;
use crate::spec::Config;
use log::{debug, info, trace, warn};
use mmu_addresses::{PageSize, PhysicalAddress};
use mmu_entry::Satp;

/// Attempts per request before giving up on slot collisions.
pub const MAX_REQUEST_ATTEMPTS: usize = 8;

/// Mixed into the run seed for the injector stream.
const INJECTOR_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// A seeded generation run over one [`Config`].
///
/// ```rust
/// use mmu_testgen::{Config, Generator, PagingMode, PhysicalAddress, TestCaseSpec};
///
/// let config = Config::new(PagingMode::Sv39)
///     .with_lower_bound(PhysicalAddress::new(0x8000_0000))
///     .with_memory_size(0x100_0000_u64)
///     .with_test_cases(vec![TestCaseSpec::default().with_repeats(4_u32)]);
///
/// let report = Generator::new(config, 42).run()?;
/// assert_eq!(report.generated().count(), 4);
/// # Ok::<(), mmu_testgen::SpecError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Generator {
    config: Config,
    seed: u64,
}

impl Generator {
    #[must_use]
    pub const fn new(config: Config, seed: u64) -> Self {
        Self { config, seed }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Generate every case of the configuration.
    ///
    /// Requests that fail are recorded in the report; the run continues.
    ///
    /// # Errors
    /// [`SpecError::InvalidSpec`] if the configuration is invalid. Nothing is
    /// allocated in that case.
    pub fn run(&self) -> Result<GenerationReport, SpecError> {
        let config = &self.config;
        let bounds = config.validate()?;
        info!(
            "generating {} templates in {} with seed {} (data {:#x}..{:#x}, tables {:#x}..{:#x})",
            config.test_cases.len(),
            config.mode,
            self.seed,
            bounds.data.start,
            bounds.data.end,
            bounds.tables.start,
            bounds.tables.end
        );

        let mut draws = RandomDraws::from_seed(self.seed);
        let mut injector = RandomDraws::from_seed(self.seed ^ INJECTOR_STREAM);

        let requests = expand(config, &bounds, &mut draws)?;
        let mut pool = AddressPool::new(config.mode, bounds);
        let default_root = self.default_root(&mut pool, &mut draws)?;

        let mut cases = Vec::with_capacity(requests.len());
        for request in &requests {
            let result = generate_one(&mut pool, default_root, request, &mut draws, &mut injector);
            match &result {
                Ok(case) => debug!("#{} {case}", request.ordinal),
                Err(failure) => warn!("{failure}"),
            }
            cases.push(result);
        }

        let report = GenerationReport::new(self.seed, &pool, cases);
        info!(
            "generated {} of {} cases, {} page-table entries, {} draws",
            report.generated().count(),
            report.cases.len(),
            report.page_tables.len(),
            draws.draws()
        );
        Ok(report)
    }

    /// Set up the run-wide root, if the configuration names one.
    fn default_root(
        &self,
        pool: &mut AddressPool,
        draws: &mut RandomDraws,
    ) -> Result<Option<Satp>, SpecError> {
        let Some(spec) = self.config.resolved_satp() else {
            return Ok(None);
        };
        let mode = pool.mode();
        let level = mode.root_level();
        let invalid = |e: GenerationError| SpecError::invalid(SpecPosition::Config, format!("satp: {e}"));

        let mut txn = Transaction::default();
        let root = match spec.ppn.resolve(draws) {
            Some(ppn) => {
                let root = PhysicalAddress::from_ppn(ppn);
                if !pool.claim_table(&mut txn, root, level, root).map_err(invalid)? {
                    txn.add_root(root);
                }
                root
            }
            None => pool
                .reserve_physical(
                    &mut txn,
                    Purpose::Root { level },
                    PageSize::Size4K,
                    &AddressConstraint::default(),
                    draws,
                )
                .map_err(invalid)?,
        };
        pool.commit(txn);

        debug!("run-wide root table at {root} (asid {})", spec.asid);
        Ok(Some(Satp::new(mode, spec.asid, root.ppn())))
    }
}

/// Build, inject and commit one request, retrying random collisions.
fn generate_one(
    pool: &mut AddressPool,
    default_root: Option<Satp>,
    request: &Request,
    draws: &mut RandomDraws,
    injector: &mut RandomDraws,
) -> Result<GeneratedCase, RequestFailure> {
    let fail = |error| RequestFailure::new(request.ordinal, request.spec_index, error);

    for attempt in 0..MAX_REQUEST_ATTEMPTS {
        let mut txn = Transaction::default();
        let built = Builder::new(pool, default_root).build(&mut txn, request, draws);
        let mut case = match built {
            Ok(case) => case,
            Err(BuildError::Collision { address }) => {
                trace!(
                    "request #{}: slot {address} taken, retrying (attempt {attempt})",
                    request.ordinal
                );
                continue;
            }
            Err(BuildError::Failed(error)) => return Err(fail(error)),
        };

        if let Some(kinds) = &request.inject {
            let kind = inject(&mut case, kinds, injector).map_err(fail)?;
            debug!("request #{}: injected {kind}", request.ordinal);
        }

        pool.stage_case(&mut txn, &case);
        pool.commit(txn);
        return Ok(case);
    }

    Err(fail(GenerationError::PoolExhausted {
        space: Space::Entry,
        attempts: MAX_REQUEST_ATTEMPTS,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{SatpSpec, TestCaseSpec};
    use mmu_addresses::PagingMode;

    fn config() -> Config {
        Config::new(PagingMode::Sv39)
            .with_lower_bound(PhysicalAddress::new(0x8000_0000))
            .with_memory_size(0x1000_0000_u64)
    }

    #[test]
    fn invalid_configs_abort_before_generation() {
        let config = config().with_test_cases(vec![
            TestCaseSpec::default(),
            TestCaseSpec::default().with_pagesize(PageSize::Size4M),
        ]);
        let err = Generator::new(config, 1).run().unwrap_err();
        assert_eq!(err.position(), SpecPosition::TestCase(1));
    }

    #[test]
    fn run_wide_root_is_shared() {
        let config = config()
            .with_satp(SatpSpec::default().with_ppn(0x8_0010_u64).with_asid(7_u16))
            .with_test_cases(vec![TestCaseSpec::default().with_repeats(5_u32)]);
        let report = Generator::new(config, 3).run().unwrap();
        assert_eq!(report.generated().count(), 5);
        for case in report.generated() {
            assert_eq!(case.satp.ppn, 0x8_0010);
            assert_eq!(case.satp.asid, 7);
        }
    }

    #[test]
    fn run_wide_root_outside_tables_is_invalid() {
        let config = config().with_satp(SatpSpec::default().with_ppn(0x10_u64));
        let err = Generator::new(config, 3).run().unwrap_err();
        assert_eq!(err.position(), SpecPosition::Config);
    }

    #[test]
    fn failures_do_not_stop_the_run() {
        let va = mmu_addresses::VirtualAddress::new(0x4000_0000);
        let config = config().with_test_cases(vec![
            TestCaseSpec::default().with_va(va),
            TestCaseSpec::default().with_va(va),
            TestCaseSpec::default(),
        ]);
        let report = Generator::new(config, 4).run().unwrap();
        assert!(report.cases[0].is_ok());
        let failure = report.cases[1].as_ref().unwrap_err();
        assert_eq!(failure.spec_index, 1);
        assert!(matches!(
            failure.error,
            GenerationError::AddressConflict { space: Space::Virtual, .. }
        ));
        assert!(report.cases[2].is_ok());
    }
}
