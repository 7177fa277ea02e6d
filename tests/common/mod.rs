#![allow(dead_code)]
use async_task::Task;
use rma_core::{
    Engine, EngineBuilder, LoopbackFabric, LoopbackOptions, PacketKind, PacketRecord,
    ProgressExecutor, RmaResult, WinId,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `num_ranks` engines on one loopback fabric, all driven by one executor.
pub struct World {
    pub fabric: LoopbackFabric,
    pub executor: ProgressExecutor,
    pub engines: Vec<Engine>,
    servers: Vec<Task<RmaResult<()>>>,
}

impl World {
    pub fn new(num_ranks: usize) -> World {
        World::with_options(num_ranks, LoopbackOptions::default(), |b| b)
    }

    pub fn with_options(
        num_ranks: usize,
        options: LoopbackOptions,
        configure: impl Fn(EngineBuilder) -> EngineBuilder,
    ) -> World {
        init_tracing();
        let fabric = LoopbackFabric::with_options(num_ranks, options);
        let executor = ProgressExecutor::new();
        let engines = (0..num_ranks)
            .map(|rank| {
                configure(Engine::builder(fabric.endpoint(rank)).executor(executor.clone()))
                    .build()
            })
            .collect();
        World {
            fabric,
            executor,
            engines,
            servers: vec![],
        }
    }

    pub fn rank(&self, rank: usize) -> &Engine {
        &self.engines[rank]
    }

    /// Creates a window of `size` bytes on every rank.
    pub fn create_window(&self, size: usize) -> WinId {
        let ids: Vec<WinId> = self
            .engines
            .iter()
            .map(|e| e.create_window(size).unwrap())
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        ids[0]
    }

    /// Keeps the given ranks progressing in the background.
    pub fn serve(&mut self, ranks: &[usize]) {
        for rank in ranks {
            let server = self.executor.spawn(self.engines[*rank].clone().serve());
            self.servers.push(server);
        }
    }

    pub fn run_ticks(&self, n: usize) {
        self.executor.run_ticks(n);
    }

    /// Stops every server, failing the test if one stopped on an error.
    pub fn stop(mut self) {
        for engine in &self.engines {
            engine.shutdown();
        }
        for server in std::mem::take(&mut self.servers) {
            self.executor.block_on(server).unwrap();
        }
    }

    pub fn sent(&self, src: usize, dest: usize) -> Vec<PacketRecord> {
        self.fabric
            .packet_log()
            .into_iter()
            .filter(|r| r.src == src && r.dest == dest)
            .collect()
    }

    pub fn count(&self, src: usize, dest: usize, kind: PacketKind) -> usize {
        self.sent(src, dest).iter().filter(|r| r.kind == kind).count()
    }

    /// Destinations of the lock grants sent by `target`, in order.
    pub fn grants_from(&self, target: usize) -> Vec<usize> {
        self.fabric
            .packet_log()
            .iter()
            .filter(|r| r.src == target && r.grants_lock())
            .map(|r| r.dest)
            .collect()
    }
}
