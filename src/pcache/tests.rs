use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        Arc, Barrier, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use libc::{EBUSY, EINVAL, EIO, ENODEV};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};

use super::*;

const PAGE_COUNT: u64 = 8;

/// Backing store that keeps one fill byte per page.
#[derive(Default)]
struct Backing {
    store: Mutex<BTreeMap<u64, u8>>,
    reads: AtomicU32,
    writes: AtomicU32,
    fail_reads: AtomicBool,
    read_delay: Option<Duration>,
}

impl PageIo for Backing {
    fn read_page(&self, page: &PageRef) -> Result<()> {
        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EIO);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let fill = self.store.lock().get(&page.offset()).copied().unwrap_or(0);
        page.with_data_mut(|data| data.fill(fill));
        Ok(())
    }

    fn write_page(&self, page: &PageRef) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let fill = page.with_data(|data| data[0]);
        self.store.lock().insert(page.offset(), fill);
        Ok(())
    }
}

fn pool_over(backing: &Arc<Backing>) -> Arc<PageCachePool> {
    let io: Weak<dyn PageIo> = Arc::downgrade(backing) as Weak<dyn PageIo>;
    PageCachePool::new(PAGE_SIZE, io)
}

fn offset(index: u64) -> u64 {
    index * PAGE_SIZE as u64
}

#[derive(Debug, Clone, Default)]
struct PageModel {
    fill: u8,
    dirty: bool,
    held: usize,
}

#[derive(Debug, Clone, Default)]
struct PoolModel {
    cached: BTreeMap<u64, PageModel>,
    /// Fill byte per written-back page, keyed by byte offset like [`Backing`].
    backing: BTreeMap<u64, u8>,
}

#[derive(Debug, Clone)]
enum Transition {
    Get(u64),
    Put(u64),
    Write(u64, u8),
    Sync(u64),
    SyncAll,
    ShrinkAll,
    Invalidate(u64),
}

struct PoolReference;

impl ReferenceStateMachine for PoolReference {
    type State = PoolModel;

    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(PoolModel::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let mut strats = vec![
            (0..PAGE_COUNT).prop_map(Transition::Get).boxed(),
            Just(Transition::SyncAll).boxed(),
            Just(Transition::ShrinkAll).boxed(),
        ];

        let held: Vec<u64> = state
            .cached
            .iter()
            .filter(|(_, page)| page.held > 0)
            .map(|(&index, _)| index)
            .collect();
        if !held.is_empty() {
            strats.push(
                proptest::sample::select(held.clone())
                    .prop_map(Transition::Put)
                    .boxed(),
            );
            strats.push(
                (proptest::sample::select(held.clone()), any::<u8>())
                    .prop_map(|(index, fill)| Transition::Write(index, fill))
                    .boxed(),
            );
            strats.push(
                proptest::sample::select(held)
                    .prop_map(Transition::Sync)
                    .boxed(),
            );
        }

        let idle: Vec<u64> = (0..PAGE_COUNT)
            .filter(|index| state.cached.get(index).is_none_or(|page| page.held == 0))
            .collect();
        if !idle.is_empty() {
            strats.push(
                proptest::sample::select(idle)
                    .prop_map(Transition::Invalidate)
                    .boxed(),
            );
        }

        proptest::strategy::Union::new(strats).boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match *transition {
            Transition::Get(index) => {
                let fill = state.backing.get(&offset(index)).copied().unwrap_or(0);
                let page = state.cached.entry(index).or_insert(PageModel {
                    fill,
                    ..PageModel::default()
                });
                page.held += 1;
            }
            Transition::Put(index) => {
                if let Some(page) = state.cached.get_mut(&index) {
                    page.held -= 1;
                }
            }
            Transition::Write(index, fill) => {
                if let Some(page) = state.cached.get_mut(&index) {
                    page.fill = fill;
                    page.dirty = true;
                }
            }
            Transition::Sync(index) => {
                if let Some(page) = state.cached.get_mut(&index) {
                    if page.dirty {
                        state.backing.insert(offset(index), page.fill);
                        page.dirty = false;
                    }
                }
            }
            Transition::SyncAll => {
                for (&index, page) in state.cached.iter_mut() {
                    if page.dirty {
                        state.backing.insert(offset(index), page.fill);
                        page.dirty = false;
                    }
                }
            }
            Transition::ShrinkAll => {
                state.cached.retain(|_, page| page.dirty || page.held > 0);
            }
            Transition::Invalidate(index) => {
                if let Some(page) = state.cached.remove(&index) {
                    if page.dirty {
                        state.backing.insert(offset(index), page.fill);
                    }
                }
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        let held = |index: &u64| state.cached.get(index).map_or(0, |page| page.held);
        match transition {
            Transition::Put(index) | Transition::Write(index, _) | Transition::Sync(index) => {
                held(index) > 0
            }
            Transition::Invalidate(index) => held(index) == 0,
            _ => true,
        }
    }
}

struct PoolState {
    backing: Arc<Backing>,
    pool: Arc<PageCachePool>,
    held: BTreeMap<u64, Vec<PageRef>>,
}

impl Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("pool", &self.pool)
            .field("backing", &*self.backing.store.lock())
            .finish()
    }
}

impl PoolState {
    fn held(&self, index: u64) -> &PageRef {
        self.held
            .get(&index)
            .and_then(|refs| refs.last())
            .expect("transition requires a held page")
    }
}

impl StateMachineTest for PoolState {
    type SystemUnderTest = PoolState;

    type Reference = PoolReference;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let backing = Arc::new(Backing::default());
        let pool = pool_over(&backing);
        PoolState {
            backing,
            pool,
            held: BTreeMap::new(),
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        match transition {
            Transition::Get(index) => {
                let page = state.pool.get(offset(index)).expect("get failed");
                assert!(page.state().is_valid());
                assert!(!page.is_busy());
                state.held.entry(index).or_default().push(page);
            }
            Transition::Put(index) => {
                let refs = state.held.get_mut(&index).expect("no held page");
                refs.pop();
            }
            Transition::Write(index, fill) => {
                let page = state.held(index);
                page.with_data_mut(|data| data.fill(fill));
                page.mark_dirty().expect("mark_dirty failed");
            }
            Transition::Sync(index) => {
                state.held(index).sync().expect("sync failed");
                assert!(!state.held(index).is_dirty());
            }
            Transition::SyncAll => {
                state.pool.sync_all().expect("sync_all failed");
            }
            Transition::ShrinkAll => {
                state.pool.shrink(None);
            }
            Transition::Invalidate(index) => {
                state.pool.invalidate(offset(index)).expect("invalidate failed");
                assert!(!state.pool.contains(offset(index)));
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let pool = &state.pool;
        assert_eq!(pool.len(), ref_state.cached.len());
        let dirty = ref_state.cached.values().filter(|page| page.dirty).count();
        assert_eq!(pool.dirty_len(), dirty);
        assert_eq!(pool.clean_len(), ref_state.cached.len() - dirty);
        assert_eq!(*state.backing.store.lock(), ref_state.backing);

        for (&index, model) in &ref_state.cached {
            let refs = state.held.get(&index).map_or(0, Vec::len);
            assert_eq!(refs, model.held);
            if let Some(page) = state.held.get(&index).and_then(|refs| refs.last()) {
                assert_eq!(page.ref_count() as usize, model.held + 1);
                assert_eq!(page.is_dirty(), model.dirty);
                page.with_data(|data| assert!(data.iter().all(|&b| b == model.fill)));
            }
        }
    }
}

prop_state_machine! {
    #[test]
    fn prop_state_machine(sequential 1..100 => PoolState);
}

#[test]
fn hit_does_not_reload() {
    let backing = Arc::new(Backing::default());
    let pool = pool_over(&backing);
    let first = pool.get(0).unwrap();
    let second = pool.get(0).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(backing.reads.load(Ordering::SeqCst), 1);
    assert_eq!(first.ref_count(), 3);
}

#[test]
fn misaligned_offset_is_invalid() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    assert_eq!(pool.get(100).unwrap_err(), EINVAL);
}

#[test]
fn anonymous_pages_start_zeroed_and_clean() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    let page = pool.get(offset(3)).unwrap();
    assert_eq!(page.state(), PageState::CLEAN);
    page.with_data(|data| assert!(data.iter().all(|&b| b == 0)));
    page.write(0, b"anon").unwrap();
    assert_eq!(pool.sync_all().unwrap(), 1);
}

#[test]
fn write_marks_dirty_and_sync_cleans() {
    let backing = Arc::new(Backing::default());
    let pool = pool_over(&backing);
    let page = pool.get(0).unwrap();

    page.write(0, &[9; 16]).unwrap();
    assert_eq!(page.state(), PageState::DIRTY);
    assert_eq!(pool.dirty_offsets(), vec![0]);

    page.sync().unwrap();
    assert_eq!(page.state(), PageState::CLEAN);
    assert_eq!(backing.store.lock().get(&0), Some(&9));

    // Syncing a clean page does nothing.
    page.sync().unwrap();
    assert_eq!(backing.writes.load(Ordering::SeqCst), 1);
}

#[test]
fn out_of_range_access_is_invalid() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    let page = pool.get(0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(page.read(PAGE_SIZE - 4, &mut buf), Err(EINVAL));
    assert_eq!(page.write(PAGE_SIZE, &buf), Err(EINVAL));
    assert!(!page.is_dirty());
}

#[test]
fn shrink_evicts_least_recently_used_first() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    for index in 0..3 {
        drop(pool.get(offset(index)).unwrap());
    }
    drop(pool.get(offset(0)).unwrap());

    assert_eq!(pool.shrink(Some(1)), 1);
    assert!(!pool.contains(offset(1)));
    assert!(pool.contains(offset(0)));
    assert!(pool.contains(offset(2)));
}

#[test]
fn shrink_skips_dirty_and_referenced_pages() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    let held = pool.get(offset(0)).unwrap();
    pool.get(offset(1)).unwrap().write(0, b"d").unwrap();
    drop(pool.get(offset(2)).unwrap());

    assert_eq!(pool.shrink(None), 1);
    assert_eq!(pool.len(), 2);
    assert!(pool.contains(offset(0)));
    drop(held);
}

#[test]
fn failed_load_is_not_cached() {
    let backing = Arc::new(Backing::default());
    backing.fail_reads.store(true, Ordering::SeqCst);
    let pool = pool_over(&backing);

    assert_eq!(pool.get(0).unwrap_err(), EIO);
    assert!(pool.is_empty());

    backing.fail_reads.store(false, Ordering::SeqCst);
    assert!(pool.get(0).is_ok());
}

#[test]
fn vanished_backing_store_is_no_device() {
    let backing = Arc::new(Backing::default());
    let pool = pool_over(&backing);
    drop(backing);
    assert_eq!(pool.get(0).unwrap_err(), ENODEV);
}

#[test]
fn concurrent_gets_share_one_load() {
    let backing = Arc::new(Backing {
        read_delay: Some(Duration::from_millis(20)),
        ..Backing::default()
    });
    let pool = pool_over(&backing);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let page = pool.get(0).unwrap();
                assert!(page.state().is_valid());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(backing.reads.load(Ordering::SeqCst), 1);
    assert_eq!(pool.len(), 1);
}

#[test]
fn concurrent_get_put_balances_refs() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || {
                for n in 0..200u64 {
                    let page = pool.get(offset((n + i) % 4)).unwrap();
                    drop(page.clone());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for index in 0..4 {
        let page = pool.lookup(offset(index)).unwrap();
        assert_eq!(page.ref_count(), 2);
    }
}

#[test]
fn invalidate_writes_back_then_drops() {
    let backing = Arc::new(Backing::default());
    let pool = pool_over(&backing);
    pool.get(offset(2)).unwrap().write(0, &[5]).unwrap();

    pool.invalidate(offset(2)).unwrap();
    assert!(!pool.contains(offset(2)));
    assert_eq!(backing.store.lock().get(&offset(2)), Some(&5));

    // Missing pages are fine.
    pool.invalidate(offset(7)).unwrap();
}

#[test]
fn truncate_drops_tail_pages_and_zeroes_partial_page() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    for index in 0..3 {
        pool.get(offset(index)).unwrap().write(0, &[1; PAGE_SIZE]).unwrap();
    }

    pool.truncate(PAGE_SIZE as u64 + 10).unwrap();
    assert!(pool.contains(offset(0)));
    assert!(pool.contains(offset(1)));
    assert!(!pool.contains(offset(2)));

    let page = pool.lookup(offset(1)).unwrap();
    page.with_data(|data| {
        assert!(data[..10].iter().all(|&b| b == 1));
        assert!(data[10..].iter().all(|&b| b == 0));
    });
}

#[test]
fn destroy_requires_unreferenced_pages() {
    let backing = Arc::new(Backing::default());
    let pool = pool_over(&backing);
    let page = pool.get(0).unwrap();
    page.write(0, &[3]).unwrap();

    assert_eq!(pool.destroy(), Err(EBUSY));
    // The failed attempt still wrote the page back.
    assert_eq!(backing.store.lock().get(&0), Some(&3));

    drop(page);
    pool.destroy().unwrap();
    assert!(pool.is_empty());
}

#[test]
fn last_put_frees_detached_page() {
    let pool = PageCachePool::anonymous(PAGE_SIZE);
    let page = pool.get(0).unwrap();
    let detached = page.page_arc().clone();
    pool.invalidate(0).unwrap();
    assert_eq!(page.ref_count(), 1);
    drop(page);
    assert_eq!(detached.ref_count(), 0);
    assert!(detached.buffers().is_empty());
}
