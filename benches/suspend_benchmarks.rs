use criterion::{Criterion, criterion_group, criterion_main};
use std::{
    hint::black_box,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};
use threadlist::{CheckpointBarrier, SuspendConfig, ThreadHandle, ThreadList, ThreadOptions};

fn spawn_pollers(list: &Arc<ThreadList>, count: usize, stop: &Arc<AtomicBool>) -> Vec<thread::JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let (list, stop) = (list.clone(), stop.clone());
            let (tx, rx) = crossbeam::channel::bounded(1);
            let join = thread::spawn(move || {
                let me = list
                    .register(ThreadOptions::new(format!("bench-{i}")))
                    .expect("register poller");
                let _ = tx.send(());
                while !stop.load(Ordering::Relaxed) {
                    me.poll();
                    std::hint::spin_loop();
                }
                list.unregister(me);
            });
            let _ = rx.recv();
            join
        })
        .collect()
}

fn bench_poll_fast_path(c: &mut Criterion) {
    let list = ThreadList::new(SuspendConfig::default());
    let me = list
        .register(ThreadOptions::new("bench-main"))
        .expect("register bench thread");

    c.bench_function("poll_fast_path", |b| {
        b.iter(|| black_box(&me).poll());
    });

    list.unregister(me);
}

fn bench_suspend_all_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("suspend_all_round_trip");
    for threads in [1usize, 4, 8] {
        let list = ThreadList::new(SuspendConfig::default());
        let stop = Arc::new(AtomicBool::new(false));
        let pollers = spawn_pollers(&list, threads, &stop);

        group.bench_function(format!("{threads}_threads"), |b| {
            b.iter(|| {
                list.suspend_all("bench", false);
                list.resume_all();
            });
        });

        stop.store(true, Ordering::Relaxed);
        for poller in pollers {
            poller.join().expect("poller exited");
        }
    }
    group.finish();
}

fn bench_checkpoint_rendezvous(c: &mut Criterion) {
    let list = ThreadList::new(SuspendConfig::default());
    let stop = Arc::new(AtomicBool::new(false));
    let pollers = spawn_pollers(&list, 4, &stop);
    let barrier = Arc::new(CheckpointBarrier::new());

    c.bench_function("checkpoint_4_threads", |b| {
        b.iter(|| {
            let pass = barrier.clone();
            let count = list.run_checkpoint(move |_: &ThreadHandle| pass.pass());
            barrier.wait(count, std::time::Duration::from_secs(30))
        });
    });

    stop.store(true, Ordering::Relaxed);
    for poller in pollers {
        poller.join().expect("poller exited");
    }
}

criterion_group!(
    benches,
    bench_poll_fast_path,
    bench_suspend_all_round_trip,
    bench_checkpoint_rendezvous
);
criterion_main!(benches);
