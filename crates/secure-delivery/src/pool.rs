use crossbeam_channel::unbounded;

/// Runs `f` over `items` on at most `max_concurrency` threads and blocks
/// until every item has produced an output. Outputs are returned in
/// completion order.
pub fn run_bounded<T, R, F>(items: Vec<T>, max_concurrency: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }

    let total = items.len();
    let workers = max_concurrency.max(1).min(total);

    if workers == 1 {
        return items.into_iter().map(f).collect();
    }

    let (job_tx, job_rx) = unbounded();
    for item in items {
        let _ = job_tx.send(item);
    }
    drop(job_tx);

    let (out_tx, out_rx) = unbounded();
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let f = &f;
            scope.spawn(move || {
                for item in job_rx.iter() {
                    let _ = out_tx.send(f(item));
                }
            });
        }
    });
    drop(out_tx);

    let outputs: Vec<R> = out_rx.iter().collect();
    debug_assert_eq!(outputs.len(), total);
    outputs
}
