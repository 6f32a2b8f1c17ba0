//! The parallel diffusive nested sampling driver.
//!
//! A fixed ensemble of `num_particles · T` model particles is advanced by
//! `T` worker threads in lockstep iterations, each bounded by a reusable
//! barrier and split into three phases:
//!
//! - **Phase A** (thread 0): snapshot the master level ladder into every
//!   worker's private copy and fold the external stop flag plus the
//!   save-count budget into a single shared terminate decision.
//! - **Phase B** (all threads): `thread_steps` MCMC moves per worker
//!   against its own particle slice, likelihoods, assignments, RNG, level
//!   copy, and above-threshold staging buffer.
//! - **Phase C** (thread 0): merge counter diffs back into the master,
//!   drain the staging buffers, maybe create a level, recompute level
//!   masses, adapt the work-rate coefficient, and maybe save outputs plus
//!   a checkpoint.
//!
//! Between barriers each thread touches strictly disjoint state, so the
//! per-slice mutexes below are uncontended by construction; they exist to
//! make the phase discipline sound rather than to arbitrate races. All
//! cross-phase counters are atomics written in phase C and read by
//! workers only after the phase-A barrier, which orders them.
//!
//! Changing `T` repartitions the random streams and therefore the
//! trajectory; for a fixed `T`, option set, and seed, runs are
//! bit-reproducible, including across a checkpoint/restart.

use crate::barrier::Barrier;
use crate::checkpoint::{BestRecord, Checkpoint};
use crate::level::Level;
use crate::likelihood::LogLikelihood;
use crate::options::Options;
use crate::output;
use dn_core::{Error, Model, Result, Rng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Atomic cell for an `f64`, stored as its bit pattern.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Per-worker view of the shared control state, captured once after the
/// phase-A barrier so a whole MCMC phase is internally consistent.
#[derive(Clone, Copy)]
struct WorkerContext {
    lambda: f64,
    beta: f64,
    work_ratio: f64,
    /// Effective level cap; `0` while the ladder is still growing under
    /// auto detection.
    max_num_levels: usize,
}

impl WorkerContext {
    fn ladder_complete(&self, level_count: usize) -> bool {
        self.max_num_levels != 0 && level_count >= self.max_num_levels
    }

    /// Soft bias pushing particles toward the newest levels while the
    /// ladder is still growing.
    fn log_push(&self, which_level: usize, level_count: usize) -> f64 {
        if self.ladder_complete(level_count) {
            return 0.0;
        }
        (which_level as f64 - (level_count as f64 - 1.0)) / (self.work_ratio * self.lambda)
    }
}

/// Diffusive nested sampler over a user model.
pub struct Sampler<M: Model> {
    save_to_disk: bool,
    num_threads: usize,
    compression: f64,
    options: Options,
    initialised: bool,

    // Ensembles, one slice per worker: particle i lives in
    // slice i / num_particles at offset i % num_particles.
    particles: Vec<Mutex<Vec<M>>>,
    log_likelihoods: Vec<Mutex<Vec<LogLikelihood>>>,
    level_assignments: Vec<Mutex<Vec<usize>>>,

    // Master ladder state; written only by thread 0 during phase C.
    levels: Mutex<Vec<Level>>,
    copies_of_levels: Vec<Mutex<Vec<Level>>>,
    all_above: Mutex<Vec<LogLikelihood>>,
    above: Vec<Mutex<Vec<LogLikelihood>>>,

    rngs: Vec<Mutex<Rng>>,
    barrier: Barrier,

    should_stop: Arc<AtomicBool>,
    terminate: AtomicBool,
    run_error: Mutex<Option<Error>>,

    count_saves: AtomicU32,
    count_mcmc_steps: AtomicU64,
    mcmc_steps_since_save: AtomicU64,
    /// Effective level cap; fixed to the ladder size once auto detection
    /// declares completion.
    effective_max_num_levels: AtomicUsize,
    replacements: AtomicU64,

    difficulty: AtomicF64,
    work_ratio: AtomicF64,

    best: Mutex<Option<BestRecord<M>>>,
}

impl<M: Model> Sampler<M> {
    /// Create a sampler. Fails on an invalid configuration, in
    /// particular auto level detection combined with a compression other
    /// than `e`.
    pub fn new(
        num_threads: usize,
        compression: f64,
        options: Options,
        save_to_disk: bool,
    ) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::Config("num_threads must be at least 1".into()));
        }
        options.validate(compression)?;

        let levels = vec![Level::floor()];
        Ok(Self {
            save_to_disk,
            num_threads,
            compression,
            effective_max_num_levels: AtomicUsize::new(options.max_num_levels),
            options,
            initialised: false,
            particles: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
            log_likelihoods: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
            level_assignments: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
            copies_of_levels: (0..num_threads).map(|_| Mutex::new(levels.clone())).collect(),
            levels: Mutex::new(levels),
            all_above: Mutex::new(Vec::new()),
            above: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
            rngs: (0..num_threads).map(|i| Mutex::new(Rng::with_seed(i as u64))).collect(),
            barrier: Barrier::new(num_threads),
            should_stop: Arc::new(AtomicBool::new(false)),
            terminate: AtomicBool::new(false),
            run_error: Mutex::new(None),
            count_saves: AtomicU32::new(0),
            count_mcmc_steps: AtomicU64::new(0),
            mcmc_steps_since_save: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            difficulty: AtomicF64::new(0.0),
            work_ratio: AtomicF64::new(1.0),
            best: Mutex::new(None),
        })
    }

    /// The flag a host sets to request an orderly stop. Checked at the
    /// top of every lockstep iteration; worst-case latency is one MCMC
    /// phase.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    /// Extend the save budget of a (possibly finished) run.
    ///
    /// On overflow the budget is left unchanged.
    pub fn increase_max_num_saves(&mut self, increment: u32) -> Result<()> {
        let raised = self
            .options
            .max_num_saves
            .checked_add(increment)
            .ok_or_else(|| Error::Overflow("increasing max_num_saves overflows".into()))?;
        self.options.max_num_saves = raised;
        Ok(())
    }

    /// Total particles across all threads.
    fn particle_count(&self) -> usize {
        self.options.num_particles * self.num_threads
    }

    /// Prepare the ensemble: draw from the prior, or restore the exact
    /// state from `options.checkpoint_file`.
    pub fn initialise(&mut self, first_seed: u64, continue_from_checkpoint: bool) -> Result<()> {
        if continue_from_checkpoint {
            self.restore()?;
        } else {
            self.fresh_init(first_seed)?;
        }
        self.initialised = true;
        Ok(())
    }

    fn fresh_init(&mut self, first_seed: u64) -> Result<()> {
        tracing::info!(first_seed, "seeding random number generators");
        for (i, rng) in self.rngs.iter_mut().enumerate() {
            rng.get_mut().unwrap().set_seed(first_seed + i as u64);
        }

        tracing::info!(count = self.particle_count(), "generating particles from the prior");
        let num_particles = self.options.num_particles;
        // Every particle is drawn with thread 0's generator, matching the
        // restart stream exactly.
        let mut rng = self.rngs[0].lock().unwrap();
        for t in 0..self.num_threads {
            let mut particles = Vec::with_capacity(num_particles);
            let mut logls = Vec::with_capacity(num_particles);
            for _ in 0..num_particles {
                let particle = M::from_prior(&mut rng);
                logls.push(LogLikelihood::new(particle.log_likelihood(), rng.rand()));
                particles.push(particle);
            }
            *self.particles[t].lock().unwrap() = particles;
            *self.log_likelihoods[t].lock().unwrap() = logls;
            *self.level_assignments[t].lock().unwrap() = vec![0; num_particles];
        }
        drop(rng);

        if self.save_to_disk {
            let particles = self.particles[0].lock().unwrap();
            output::initialise(&self.options, &particles[0])?;
            drop(particles);
            output::save_levels(&self.options, &self.levels.lock().unwrap())?;
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        let checkpoint = Checkpoint::<M>::read(&self.options.checkpoint_file)?;
        // The checkpointed options advanced the serialization stream only;
        // this sampler keeps the options its caller supplied.
        if checkpoint.num_threads != self.num_threads {
            return Err(Error::Checkpoint(format!(
                "checkpoint was taken with {} threads, sampler has {}",
                checkpoint.num_threads, self.num_threads
            )));
        }
        let expected = self.particle_count();
        if checkpoint.particles.len() != expected
            || checkpoint.log_likelihoods.len() != expected
            || checkpoint.level_assignments.len() != expected
        {
            return Err(Error::Checkpoint(format!(
                "checkpoint holds {} particles, configuration implies {}",
                checkpoint.particles.len(),
                expected
            )));
        }
        if checkpoint.rngs.len() != self.num_threads {
            return Err(Error::Checkpoint("checkpoint RNG count mismatch".into()));
        }
        if checkpoint.levels.is_empty() {
            return Err(Error::Checkpoint("checkpoint has no levels".into()));
        }
        let level_count = checkpoint.levels.len();
        if checkpoint.level_assignments.iter().any(|&a| a >= level_count) {
            return Err(Error::Checkpoint("checkpoint level assignment out of range".into()));
        }

        let num_particles = self.options.num_particles;
        let mut particles = checkpoint.particles;
        let mut logls = checkpoint.log_likelihoods;
        let mut assignments = checkpoint.level_assignments;
        for t in (0..self.num_threads).rev() {
            *self.particles[t].get_mut().unwrap() = particles.split_off(t * num_particles);
            *self.log_likelihoods[t].get_mut().unwrap() = logls.split_off(t * num_particles);
            *self.level_assignments[t].get_mut().unwrap() = assignments.split_off(t * num_particles);
        }
        for (cell, rng) in self.rngs.iter_mut().zip(checkpoint.rngs) {
            *cell.get_mut().unwrap() = rng;
        }
        for copy in &mut self.copies_of_levels {
            *copy.get_mut().unwrap() = checkpoint.levels.clone();
        }
        *self.levels.get_mut().unwrap() = checkpoint.levels;
        *self.all_above.get_mut().unwrap() = checkpoint.all_above;
        for above in &mut self.above {
            above.get_mut().unwrap().clear();
        }

        self.count_saves.store(checkpoint.count_saves, Ordering::SeqCst);
        self.count_mcmc_steps.store(checkpoint.count_mcmc_steps, Ordering::SeqCst);
        self.mcmc_steps_since_save.store(checkpoint.mcmc_steps_since_save, Ordering::SeqCst);
        self.difficulty.store(checkpoint.difficulty);
        self.work_ratio.store(checkpoint.work_ratio);
        self.replacements.store(checkpoint.replacements, Ordering::SeqCst);
        *self.best.get_mut().unwrap() = checkpoint.best;

        // A completed ladder stays completed across the restart; an
        // unfinished one takes the caller's cap.
        let ladder_complete =
            checkpoint.max_num_levels != 0 && level_count >= checkpoint.max_num_levels;
        let effective = if ladder_complete {
            checkpoint.max_num_levels
        } else {
            self.options.max_num_levels
        };
        self.effective_max_num_levels.store(effective, Ordering::SeqCst);

        tracing::info!(
            count_saves = checkpoint.count_saves,
            levels = level_count,
            "restored sampler state from checkpoint"
        );
        Ok(())
    }

    /// Run until the save budget is exhausted or the stop flag is raised.
    ///
    /// `thin` thins progress logging only: a per-save event is emitted
    /// every `thin`-th save (`0` is treated as `1`).
    pub fn run(&mut self, thin: u32) -> Result<()> {
        if !self.initialised {
            return Err(Error::Config("run called before initialise".into()));
        }
        let thin = thin.max(1);
        self.terminate.store(false, Ordering::SeqCst);
        *self.run_error.get_mut().unwrap() = None;

        let this = &*self;
        std::thread::scope(|scope| {
            for thread in 0..this.num_threads {
                scope.spawn(move || this.run_worker(thread, thin));
            }
            // Handles join at scope exit, which also guarantees teardown
            // on the abort path.
        });

        if let Some(error) = self.run_error.get_mut().unwrap().take() {
            return Err(error);
        }

        // Final state snapshot so an aborted run resumes from the last
        // completed iteration rather than the last save.
        if self.save_to_disk {
            let levels = self.levels.lock().unwrap();
            if let Err(error) = self.write_checkpoint(&levels) {
                tracing::warn!(error = %error, "final checkpoint write failed");
            }
        }
        Ok(())
    }

    fn run_worker(&self, thread: usize, thin: u32) {
        loop {
            // --- Phase A ---
            if thread == 0 {
                self.phase_a();
            }
            self.barrier.wait();
            // The terminate flag only changes while every other thread is
            // parked at the barrier above, so all workers read the same
            // decision and leave together.
            if self.terminate.load(Ordering::SeqCst) {
                return;
            }
            let context = WorkerContext {
                lambda: self.options.lambda,
                beta: self.options.beta,
                work_ratio: self.work_ratio.load(),
                max_num_levels: self.effective_max_num_levels.load(Ordering::SeqCst),
            };

            // --- Phase B ---
            self.mcmc_thread(thread, &context);
            self.barrier.wait();

            // --- Phase C ---
            if thread == 0 {
                if let Err(error) = self.bookkeeping(thin) {
                    tracing::error!(error = %error, "bookkeeping failed; stopping run");
                    *self.run_error.lock().unwrap() = Some(error);
                    self.terminate.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn phase_a(&self) {
        if self.should_stop.load(Ordering::SeqCst) {
            self.terminate.store(true, Ordering::SeqCst);
        }
        let max_num_saves = self.options.max_num_saves;
        if max_num_saves != 0 && self.count_saves.load(Ordering::SeqCst) >= max_num_saves {
            self.terminate.store(true, Ordering::SeqCst);
        }
        let levels = self.levels.lock().unwrap();
        for copy in &self.copies_of_levels {
            copy.lock().unwrap().clone_from(&levels);
        }
    }

    // -----------------------------------------------------------------
    // Phase B: MCMC
    // -----------------------------------------------------------------

    fn mcmc_thread(&self, thread: usize, context: &WorkerContext) {
        let mut rng = self.rngs[thread].lock().unwrap();
        let mut levels = self.copies_of_levels[thread].lock().unwrap();
        let mut particles = self.particles[thread].lock().unwrap();
        let mut logls = self.log_likelihoods[thread].lock().unwrap();
        let mut assignments = self.level_assignments[thread].lock().unwrap();
        let mut above = self.above[thread].lock().unwrap();

        let num_particles = self.options.num_particles;
        for _ in 0..self.options.thread_steps {
            let which = rng.rand_int(num_particles);

            // Randomize the order of the two moves so couplings between
            // them cannot bias the chain.
            if rng.rand() <= 0.5 {
                update_particle(&mut rng, &mut levels, &mut particles, &mut logls, &assignments, which);
                update_level_assignment(&mut rng, &levels, &logls, &mut assignments, which, context);
            } else {
                update_level_assignment(&mut rng, &levels, &logls, &mut assignments, which, context);
                update_particle(&mut rng, &mut levels, &mut particles, &mut logls, &assignments, which);
            }

            let top = levels.last().expect("ladder is never empty");
            if !context.ladder_complete(levels.len()) && top.threshold() < logls[which] {
                above.push(logls[which]);
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase C: bookkeeping
    // -----------------------------------------------------------------

    fn bookkeeping(&self, thin: u32) -> Result<()> {
        let steps = self.num_threads as u64 * self.options.thread_steps;
        self.count_mcmc_steps.fetch_add(steps, Ordering::SeqCst);
        self.mcmc_steps_since_save.fetch_add(steps, Ordering::SeqCst);

        let mut levels = self.levels.lock().unwrap();

        // 1. Merge counter diffs from every worker copy. The master has
        // not changed since the phase-A snapshot, so it doubles as the
        // baseline the diffs are taken against.
        let snapshot = levels.clone();
        for copy in &self.copies_of_levels {
            let copy = copy.lock().unwrap();
            for j in 0..levels.len() {
                levels[j].increment_accepts(copy[j].accepts() - snapshot[j].accepts());
                levels[j].increment_tries(copy[j].tries() - snapshot[j].tries());
                levels[j].increment_visits(copy[j].visits() - snapshot[j].visits());
                levels[j].increment_exceeds(copy[j].exceeds() - snapshot[j].exceeds());
            }
        }

        // 2. Drain the per-thread staging buffers.
        let mut all_above = self.all_above.lock().unwrap();
        for above in &self.above {
            all_above.append(&mut above.lock().unwrap());
        }

        // 3. Maybe create a level.
        let mut created_level = false;
        if !self.enough_levels(&levels) && all_above.len() >= self.options.new_level_interval {
            all_above.sort_unstable();
            let index = ((1.0 - 1.0 / self.compression) * all_above.len() as f64) as usize;
            let threshold = all_above[index];
            tracing::info!(
                level = levels.len(),
                log_likelihood = threshold.value(),
                "creating level"
            );
            levels.push(Level::new(threshold));
            all_above.drain(0..=index);
            for above in &self.above {
                above.lock().unwrap().clear();
            }

            if self.enough_levels(&levels) {
                Level::renormalise_visits(&mut levels, self.regularisation());
                all_above.clear();
                self.effective_max_num_levels.store(levels.len(), Ordering::SeqCst);
                tracing::info!(num_levels = levels.len(), "done creating levels");
            } else {
                self.kill_lagging_particles(&levels);
            }
            created_level = true;
        }
        drop(all_above);

        // 4. Refresh the mass estimates.
        Level::recalculate_log_x(&mut levels, self.compression, self.regularisation());

        // 5. Adapt the work-rate coefficient while the ladder grows.
        if !self.enough_levels(&levels) {
            self.update_work_ratio(&levels);
        }

        if created_level && self.save_to_disk {
            output::save_levels(&self.options, &levels)?;
        }

        // 6. Maybe save.
        if self.mcmc_steps_since_save.load(Ordering::SeqCst) >= self.options.save_interval {
            self.mcmc_steps_since_save.store(0, Ordering::SeqCst);
            let count = self.count_saves.fetch_add(1, Ordering::SeqCst) + 1;
            self.save(count, thin, &levels)?;
            let max_num_saves = self.options.max_num_saves;
            if max_num_saves != 0 && count >= max_num_saves {
                self.terminate.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Regularisation for the visit statistics, in steps.
    fn regularisation(&self) -> f64 {
        self.options.new_level_interval as f64 * self.options.lambda.sqrt()
    }

    /// Has the ladder reached its final size?
    ///
    /// With a fixed cap this is a size comparison. Under auto detection
    /// the ladder is complete once the recent threshold gaps have
    /// flattened out: over the last `n = ⌊30·√(0.02·|levels|)⌋ ≥ 30`
    /// gaps, the mean must stay below 0.75 and the maximum below 1.0.
    fn enough_levels(&self, levels: &[Level]) -> bool {
        let max_num_levels = self.effective_max_num_levels.load(Ordering::SeqCst);
        if max_num_levels != 0 {
            return levels.len() >= max_num_levels;
        }

        let count = levels.len();
        let n = (30.0 * (0.02 * count as f64).sqrt()).floor() as usize;
        if n < 30 {
            return false;
        }
        let mut sum = 0.0;
        let mut max_gap = f64::NEG_INFINITY;
        for k in (count - n)..count {
            let gap = levels[k].threshold().value() - levels[k - 1].threshold().value();
            sum += gap;
            max_gap = max_gap.max(gap);
        }
        sum / (n as f64) < 0.75 && max_gap < 1.0
    }

    fn update_work_ratio(&self, levels: &[Level]) {
        let count = levels.len();
        if count < 2 {
            self.difficulty.store(0.0);
            self.work_ratio.store(1.0);
            return;
        }
        let log_c = self.compression.ln();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for i in 1..count {
            let gap = (levels[i - 1].log_x() - levels[i].log_x()) - log_c;
            let weight = ((i as f64 - count as f64) / 3.0).exp();
            weighted += weight * gap.abs() / log_c;
            total_weight += weight;
        }
        let difficulty = weighted / total_weight;

        let work_ratio_max = (20.0 / self.options.lambda.sqrt()).max(1.0);
        let work_ratio = if difficulty < 0.02 {
            1.0
        } else if difficulty >= 0.1 {
            work_ratio_max
        } else {
            1.0 + (work_ratio_max - 1.0) * (difficulty - 0.02) / 0.08
        };
        self.difficulty.store(difficulty);
        self.work_ratio.store(work_ratio);
    }

    /// Replace particles stranded far below the top of a growing ladder.
    ///
    /// Each particle is independently marked bad with a probability that
    /// rises steeply once its push falls more than ~4 units below zero;
    /// bad particles are overwritten by donors rejection-sampled in
    /// favour of high-push survivors.
    fn kill_lagging_particles(&self, levels: &[Level]) {
        let num_particles = self.options.num_particles;
        let total = self.particle_count();
        let level_count = levels.len();
        let work_ratio = self.work_ratio.load();
        let lambda = self.options.lambda;
        let log_push = |which_level: usize| {
            (which_level as f64 - (level_count as f64 - 1.0)) / (work_ratio * lambda)
        };

        let mut rng = self.rngs[0].lock().unwrap();
        let mut particles: Vec<MutexGuard<'_, Vec<M>>> =
            self.particles.iter().map(|m| m.lock().unwrap()).collect();
        let mut logls: Vec<MutexGuard<'_, Vec<LogLikelihood>>> =
            self.log_likelihoods.iter().map(|m| m.lock().unwrap()).collect();
        let mut assignments: Vec<MutexGuard<'_, Vec<usize>>> =
            self.level_assignments.iter().map(|m| m.lock().unwrap()).collect();

        let mut good = vec![true; total];
        let mut max_log_push = f64::NEG_INFINITY;
        let mut num_bad = 0;
        for i in 0..total {
            let push = log_push(assignments[i / num_particles][i % num_particles]);
            if push > max_log_push {
                max_log_push = push;
            }
            let kill_probability = (1.0 - 1.0 / (1.0 + (-push - 4.0).exp())).powi(3);
            if rng.rand() <= kill_probability {
                good[i] = false;
                num_bad += 1;
            }
        }

        if num_bad == total {
            return;
        }
        for i in 0..total {
            if good[i] {
                continue;
            }
            // Rejection-sample a donor, favouring particles near the top.
            let donor = loop {
                let candidate = rng.rand_int(total);
                if !good[candidate] {
                    continue;
                }
                let push = log_push(assignments[candidate / num_particles][candidate % num_particles]);
                if rng.rand() < (push - max_log_push).exp() {
                    break candidate;
                }
            };
            let particle = particles[donor / num_particles][donor % num_particles].clone();
            let logl = logls[donor / num_particles][donor % num_particles];
            let assignment = assignments[donor / num_particles][donor % num_particles];
            particles[i / num_particles][i % num_particles] = particle;
            logls[i / num_particles][i % num_particles] = logl;
            assignments[i / num_particles][i % num_particles] = assignment;
            let count = self.replacements.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(replacements = count, "replacing lagging particle");
        }
    }

    fn save(&self, count: u32, thin: u32, levels: &[Level]) -> Result<()> {
        if count % thin == 0 {
            tracing::info!(count, "saving particle");
        }
        if !self.save_to_disk {
            return Ok(());
        }

        output::save_levels(&self.options, levels)?;

        let num_particles = self.options.num_particles;
        let which = {
            let mut rng = self.rngs[0].lock().unwrap();
            rng.rand_int(self.particle_count())
        };
        {
            let particles = self.particles[which / num_particles].lock().unwrap();
            let logls = self.log_likelihoods[which / num_particles].lock().unwrap();
            let assignments = self.level_assignments[which / num_particles].lock().unwrap();
            output::append_sample(&self.options, &particles[which % num_particles])?;
            output::append_sample_info(
                &self.options,
                assignments[which % num_particles],
                logls[which % num_particles],
                which,
            )?;
        }

        self.update_best()?;

        if let Err(error) = self.write_checkpoint(levels) {
            tracing::warn!(error = %error, "checkpoint write failed; continuing");
        }
        Ok(())
    }

    /// Track the best-ever particle; append to the best files whenever
    /// it improves.
    fn update_best(&self) -> Result<()> {
        let num_particles = self.options.num_particles;
        let mut best_index = 0;
        let mut best_logl = LogLikelihood::floor();
        for t in 0..self.num_threads {
            let logls = self.log_likelihoods[t].lock().unwrap();
            for (i, logl) in logls.iter().enumerate() {
                if *logl > best_logl {
                    best_logl = *logl;
                    best_index = t * num_particles + i;
                }
            }
        }

        let mut best = self.best.lock().unwrap();
        let improved = best.as_ref().is_none_or(|record| best_logl > record.logl);
        if !improved {
            return Ok(());
        }
        let particle =
            self.particles[best_index / num_particles].lock().unwrap()[best_index % num_particles].clone();
        *best = Some(BestRecord { logl: best_logl, particle: particle.clone() });
        drop(best);

        tracing::info!(log_likelihood = best_logl.value(), "best particle improved");
        output::append_best(
            &self.options,
            self.count_mcmc_steps.load(Ordering::SeqCst),
            best_logl,
            &particle,
        )?;
        Ok(())
    }

    fn write_checkpoint(&self, levels: &[Level]) -> Result<()> {
        let mut particles = Vec::with_capacity(self.particle_count());
        let mut logls = Vec::with_capacity(self.particle_count());
        let mut assignments = Vec::with_capacity(self.particle_count());
        for t in 0..self.num_threads {
            particles.extend(self.particles[t].lock().unwrap().iter().cloned());
            logls.extend(self.log_likelihoods[t].lock().unwrap().iter().copied());
            assignments.extend(self.level_assignments[t].lock().unwrap().iter().copied());
        }
        debug_assert_eq!(particles.len(), self.particle_count());

        let checkpoint = Checkpoint {
            options: self.options.clone(),
            count_saves: self.count_saves.load(Ordering::SeqCst),
            count_mcmc_steps: self.count_mcmc_steps.load(Ordering::SeqCst),
            mcmc_steps_since_save: self.mcmc_steps_since_save.load(Ordering::SeqCst),
            difficulty: self.difficulty.load(),
            work_ratio: self.work_ratio.load(),
            save_to_disk: self.save_to_disk,
            num_threads: self.num_threads,
            compression: self.compression,
            max_num_levels: self.effective_max_num_levels.load(Ordering::SeqCst),
            particles,
            log_likelihoods: logls,
            level_assignments: assignments,
            levels: levels.to_vec(),
            all_above: self.all_above.lock().unwrap().clone(),
            rngs: self.rngs.iter().map(|r| r.lock().unwrap().clone()).collect(),
            best: self.best.lock().unwrap().clone(),
            replacements: self.replacements.load(Ordering::SeqCst),
        };
        checkpoint.write(&self.options.checkpoint_file)
    }

    // -----------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------

    /// The option set in effect.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Saves completed so far.
    pub fn count_saves(&self) -> u32 {
        self.count_saves.load(Ordering::SeqCst)
    }

    /// Total MCMC steps taken so far.
    pub fn count_mcmc_steps(&self) -> u64 {
        self.count_mcmc_steps.load(Ordering::SeqCst)
    }

    /// Lagging-particle replacements so far.
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::SeqCst)
    }

    /// Current compression-deviation measure.
    pub fn difficulty(&self) -> f64 {
        self.difficulty.load()
    }

    /// Current work-rate coefficient.
    pub fn work_ratio(&self) -> f64 {
        self.work_ratio.load()
    }

    /// Whether the ladder has reached its final size.
    pub fn ladder_complete(&self) -> bool {
        let levels = self.levels.lock().unwrap();
        let max_num_levels = self.effective_max_num_levels.load(Ordering::SeqCst);
        max_num_levels != 0 && levels.len() >= max_num_levels
    }

    /// A copy of the master level ladder.
    pub fn levels_snapshot(&self) -> Vec<Level> {
        self.levels.lock().unwrap().clone()
    }

    /// A copy of every particle's likelihood value, in global index
    /// order.
    pub fn log_likelihoods_snapshot(&self) -> Vec<LogLikelihood> {
        let mut out = Vec::with_capacity(self.particle_count());
        for t in 0..self.num_threads {
            out.extend(self.log_likelihoods[t].lock().unwrap().iter().copied());
        }
        out
    }

    /// A copy of every particle's level assignment, in global index
    /// order.
    pub fn level_assignments_snapshot(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.particle_count());
        for t in 0..self.num_threads {
            out.extend(self.level_assignments[t].lock().unwrap().iter().copied());
        }
        out
    }

    /// The best likelihood seen, if any save has happened.
    pub fn best_log_likelihood(&self) -> Option<LogLikelihood> {
        self.best.lock().unwrap().as_ref().map(|record| record.logl)
    }
}

// ---------------------------------------------------------------------
// The two MCMC moves
// ---------------------------------------------------------------------

/// Metropolis move of one particle within its current level.
fn update_particle<M: Model>(
    rng: &mut Rng,
    levels: &mut [Level],
    particles: &mut [M],
    logls: &mut [LogLikelihood],
    assignments: &[usize],
    which: usize,
) {
    let assignment = assignments[which];

    let mut proposal = particles[which].clone();
    let mut log_h = proposal.perturb(rng);
    let mut logl_proposal = LogLikelihood::new(proposal.log_likelihood(), logls[which].tiebreaker());
    logl_proposal.perturb_tiebreaker(rng);

    if log_h > 0.0 {
        log_h = 0.0;
    }

    // A NaN likelihood breaks the model contract; reject rather than let
    // it poison the total order.
    let acceptable = !logl_proposal.value().is_nan();
    let level = &mut levels[assignment];
    if acceptable && rng.rand() <= log_h.exp() && level.threshold() < logl_proposal {
        particles[which] = proposal;
        logls[which] = logl_proposal;
        level.increment_accepts(1);
    }
    level.increment_tries(1);

    // Transit accounting: walk upward while the particle's value clears
    // each next threshold.
    let mut j = assignment;
    while j + 1 < levels.len() {
        levels[j].increment_visits(1);
        if levels[j + 1].threshold() < logls[which] {
            levels[j].increment_exceeds(1);
            j += 1;
        } else {
            break;
        }
    }
}

/// Metropolis move of one particle's level assignment.
fn update_level_assignment(
    rng: &mut Rng,
    levels: &[Level],
    logls: &[LogLikelihood],
    assignments: &mut [usize],
    which: usize,
    context: &WorkerContext,
) {
    let current = assignments[which];
    let level_count = levels.len();

    // Log-uniform jump magnitude over ~2 decades.
    let delta = (10f64.powf(2.0 * rng.rand()) * rng.randn()).floor() as i64;
    let mut proposal = current as i64 + delta;
    if proposal == current as i64 {
        proposal = if rng.rand() < 0.5 { proposal - 1 } else { proposal + 1 };
    }
    let proposal = proposal.rem_euclid(level_count as i64) as usize;

    let mut log_a = levels[current].log_x() - levels[proposal].log_x()
        + context.log_push(proposal, level_count)
        - context.log_push(current, level_count);

    // Once the ladder is complete, bias towards under-visited levels so
    // the tries histogram flattens.
    if context.ladder_complete(level_count) {
        log_a += context.beta
            * ((levels[current].tries() + 1) as f64 / (levels[proposal].tries() + 1) as f64).ln();
    }
    if log_a > 0.0 {
        log_a = 0.0;
    }

    if rng.rand() <= log_a.exp() && levels[proposal].threshold() < logls[which] {
        assignments[which] = proposal;
    }
}
