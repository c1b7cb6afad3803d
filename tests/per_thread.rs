//! Integration test for the per-thread variant: raw alloc/free across many
//! threads, each recycling only through its own arena.

use std::sync::mpsc;

#[test]
fn per_thread_storm() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      std::thread::spawn(move || unsafe {
        let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
        for i in 0..2_000usize {
          let n = 1 + (i * 131 + t * 17) % 2_048;
          let p = ouros::alloc_nolock(n);
          assert!(!p.is_null());
          let fill = (i ^ t) as u8;
          core::ptr::write_bytes(p, fill, n);
          live.push((p, n, fill));

          if live.len() > 32 {
            let (q, m, f) = live.swap_remove(i % live.len());
            let s = core::slice::from_raw_parts(q, m);
            assert!(s.iter().all(|&b| b == f), "payload was clobbered");
            ouros::free_nolock(q);
          }
        }
        for (q, m, f) in live {
          let s = core::slice::from_raw_parts(q, m);
          assert!(s.iter().all(|&b| b == f));
          ouros::free_nolock(q);
        }
      })
    })
    .collect();

  for h in handles {
    h.join().unwrap();
  }
}

#[test]
fn foreign_free_is_a_no_op() {
  let (tx, rx) = mpsc::channel::<usize>();
  let (done_tx, done_rx) = mpsc::channel::<()>();

  let owner = std::thread::spawn(move || unsafe {
    let p = ouros::alloc_nolock(256);
    assert!(!p.is_null());
    tx.send(p as usize).unwrap();
    // Wait until the other thread tried (and failed) to free it.
    done_rx.recv().unwrap();

    // The block is still ours and still leaked: an identical request must
    // carve fresh memory.
    let q = ouros::alloc_nolock(256);
    assert!(!q.is_null());
    assert_ne!(q as usize, p as usize);
    ouros::free_nolock(q);
    ouros::free_nolock(p);
  });

  let p = rx.recv().unwrap();
  std::thread::spawn(move || unsafe {
    ouros::free_nolock(p as *mut u8);
  })
  .join()
  .unwrap();
  done_tx.send(()).unwrap();

  owner.join().unwrap();
}

#[test]
fn mixed_sizes_single_thread() {
  unsafe {
    let mut ptrs = Vec::new();
    for &n in &[0usize, 1, 15, 16, 17, 255, 4_096, 65_536] {
      let p = ouros::alloc_nolock(n);
      assert!(!p.is_null());
      ptrs.push(p);
    }
    for p in ptrs {
      ouros::free_nolock(p);
    }
  }
}
