//! TerritoryCache tests: matching, load-once, locking, write-through.

#[cfg(test)]
mod tests {
    use palace_markers::{
        AccountId, Change, ImportId, LoadPhase, MarkerError, MarkerKind, MemoryStore, Mutation,
        PositionMatcher, ServerId, TerritoryCache, TerritoryId, Tolerances, Vec3,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const FLOOR: TerritoryId = TerritoryId(561);

    fn tolerances(tol: f32) -> Tolerances {
        Tolerances {
            trap: tol,
            hoard: tol,
            silver_coffer: tol,
            unknown: tol,
        }
    }

    fn make_cache(tol: f32) -> (Arc<MemoryStore>, TerritoryCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = TerritoryCache::new(store.clone(), PositionMatcher::new(tolerances(tol)));
        (store, cache)
    }

    fn observe(kind: MarkerKind, x: f32, y: f32, z: f32) -> Mutation {
        Mutation::observe_local(kind, Vec3::new(x, y, z))
    }

    // -----------------------------------------------------------------------
    // Walkthrough
    // -----------------------------------------------------------------------

    #[test]
    fn observe_confirm_import_reimport_collapse_into_one_record() {
        let (_store, cache) = make_cache(0.5);
        let srv = ServerId::new("srv1");
        let g1 = ImportId(Uuid::from_u128(0x61));
        let g2 = ImportId(Uuid::from_u128(0x62));

        cache.apply(FLOOR, observe(MarkerKind::Trap, 10.0, 0.0, 5.0)).unwrap();
        let second = cache
            .apply(FLOOR, observe(MarkerKind::Trap, 10.05, 0.0, 5.02))
            .unwrap();
        assert_eq!(second.outcome.change, Change::Unchanged);

        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].seen);

        cache
            .apply(
                FLOOR,
                Mutation::confirm_remote(
                    MarkerKind::Trap,
                    Vec3::new(10.0, 0.0, 5.0),
                    AccountId::new("A1"),
                ),
            )
            .unwrap();
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(
            markers[0].remote_seen_on.iter().cloned().collect::<Vec<_>>(),
            vec![AccountId::new("A1")]
        );

        let pos = Vec3::new(10.0, 0.0, 5.0);
        cache
            .apply(FLOOR, Mutation::import(MarkerKind::Trap, pos, srv.clone(), g1))
            .unwrap();
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers[0].import_ids(), vec![g1]);
        assert!(markers[0].was_imported);

        cache
            .apply(FLOOR, Mutation::import(MarkerKind::Trap, pos, srv, g2))
            .unwrap();
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].import_ids(), vec![g2]);
    }

    // -----------------------------------------------------------------------
    // Matching through the cache
    // -----------------------------------------------------------------------

    #[test]
    fn near_observations_merge_in_either_order() {
        for tol in [0.25f32, 0.5, 1.0] {
            let a = observe(MarkerKind::Hoard, 3.0, 0.0, 3.0);
            let b = observe(MarkerKind::Hoard, 3.0 + tol * 0.9, 0.0, 3.0);

            let (_s, forward) = make_cache(tol);
            forward.apply(FLOOR, a.clone()).unwrap();
            forward.apply(FLOOR, b.clone()).unwrap();

            let (_s, backward) = make_cache(tol);
            backward.apply(FLOOR, b).unwrap();
            backward.apply(FLOOR, a).unwrap();

            assert_eq!(forward.snapshot(FLOOR).unwrap().len(), 1, "tol {}", tol);
            assert_eq!(backward.snapshot(FLOOR).unwrap().len(), 1, "tol {}", tol);
        }
    }

    #[test]
    fn observations_at_or_beyond_tolerance_stay_distinct() {
        for tol in [0.25f32, 0.5, 1.0] {
            let (_s, cache) = make_cache(tol);
            cache.apply(FLOOR, observe(MarkerKind::Trap, 0.0, 0.0, 0.0)).unwrap();
            cache.apply(FLOOR, observe(MarkerKind::Trap, tol, 0.0, 0.0)).unwrap();
            cache
                .apply(FLOOR, observe(MarkerKind::Trap, 0.0, 0.0, tol * 3.0))
                .unwrap();
            assert_eq!(cache.snapshot(FLOOR).unwrap().len(), 3, "tol {}", tol);
        }
    }

    #[test]
    fn same_position_different_kind_is_a_new_record() {
        let (_s, cache) = make_cache(0.5);
        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        cache.apply(FLOOR, observe(MarkerKind::Hoard, 1.0, 0.0, 1.0)).unwrap();
        assert_eq!(cache.snapshot(FLOOR).unwrap().len(), 2);
    }

    #[test]
    fn repeated_observation_is_idempotent() {
        let (store, cache) = make_cache(0.5);
        let first = cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        let again = cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        assert_eq!(first.outcome.change, Change::Created);
        assert_eq!(again.outcome.change, Change::Unchanged);
        assert_eq!(first.outcome.local_id, again.outcome.local_id);
        assert_eq!(store.upsert_count(), 1);
    }

    #[test]
    fn repeated_confirmations_keep_one_account_entry() {
        let (_s, cache) = make_cache(0.5);
        let confirm = Mutation::confirm_remote(
            MarkerKind::Hoard,
            Vec3::new(2.0, 0.0, 2.0),
            AccountId::new("A1"),
        );
        for _ in 0..5 {
            cache.apply(FLOOR, confirm.clone()).unwrap();
        }
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].remote_seen_on.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_get_or_load_loads_once() {
        let (store, cache) = make_cache(0.5);
        store.set_load_delay(Some(Duration::from_millis(50)));

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let t = cache.get_or_load(FLOOR).unwrap();
                    assert!(t.is_ready());
                });
            }
        });

        assert_eq!(store.load_count(), 1);
        cache.get_or_load(FLOOR).unwrap();
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn failed_load_stays_unloaded_and_retries() {
        let (store, cache) = make_cache(0.5);
        store.set_available(false);

        let err = cache.get_or_load(FLOOR).unwrap_err();
        assert!(matches!(err, MarkerError::StorageUnavailable { .. }));
        assert_eq!(cache.get(FLOOR).unwrap().phase(), LoadPhase::Unloaded);

        store.set_available(true);
        let t = cache.get_or_load(FLOOR).unwrap();
        assert!(t.is_ready());
        assert_eq!(store.load_count(), 2);
    }

    #[test]
    fn different_territories_load_independently() {
        let (store, cache) = make_cache(0.5);
        cache.apply(TerritoryId(1), observe(MarkerKind::Trap, 0.0, 0.0, 0.0)).unwrap();
        cache.apply(TerritoryId(2), observe(MarkerKind::Trap, 0.0, 0.0, 0.0)).unwrap();
        assert_eq!(store.load_count(), 2);
        assert_eq!(cache.territory_ids(), vec![TerritoryId(1), TerritoryId(2)]);
        assert_eq!(cache.snapshot(TerritoryId(1)).unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Concurrent mutation
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_applies_serialize_per_territory() {
        let (store, cache) = make_cache(0.5);
        let shared = Vec3::new(-50.0, 0.0, -50.0);

        std::thread::scope(|s| {
            for t in 0..8u32 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..50u32 {
                        cache
                            .apply(
                                FLOOR,
                                observe(MarkerKind::Trap, t as f32 * 100.0, 0.0, i as f32 * 2.0),
                            )
                            .unwrap();
                    }
                    cache
                        .apply(FLOOR, Mutation::observe_local(MarkerKind::Trap, shared))
                        .unwrap();
                    cache
                        .apply(
                            FLOOR,
                            Mutation::confirm_remote(
                                MarkerKind::Trap,
                                shared,
                                AccountId::new(format!("A{}", t)),
                            ),
                        )
                        .unwrap();
                });
            }
        });

        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 8 * 50 + 1);
        let hub = markers
            .iter()
            .find(|m| m.position == shared)
            .expect("shared marker");
        assert!(hub.seen);
        assert_eq!(hub.remote_seen_on.len(), 8);
        assert_eq!(store.row_count(FLOOR), 8 * 50 + 1);

        let mut ids: Vec<_> = markers.iter().map(|m| m.local_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), markers.len());
    }

    // -----------------------------------------------------------------------
    // Write failures
    // -----------------------------------------------------------------------

    #[test]
    fn write_failure_keeps_observation_and_flush_retries() {
        let (store, cache) = make_cache(0.5);
        cache.get_or_load(FLOOR).unwrap();
        store.set_available(false);

        let applied = cache.apply(FLOOR, observe(MarkerKind::Trap, 4.0, 0.0, 4.0)).unwrap();
        assert!(matches!(
            applied.write_error,
            Some(MarkerError::StorageUnavailable { .. })
        ));
        assert!(applied.marker.as_ref().unwrap().seen);
        assert_eq!(cache.snapshot(FLOOR).unwrap().len(), 1);
        assert_eq!(cache.stats(FLOOR).unwrap().pending_writes, 1);

        assert!(cache.flush(FLOOR).is_err());

        store.set_available(true);
        assert_eq!(cache.flush(FLOOR).unwrap(), 0);
        assert_eq!(store.row_count(FLOOR), 1);
    }

    #[test]
    fn next_mutation_retries_pending_writes() {
        let (store, cache) = make_cache(0.5);
        cache.get_or_load(FLOOR).unwrap();
        store.set_available(false);
        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        assert_eq!(store.row_count(FLOOR), 0);

        store.set_available(true);
        let applied = cache.apply(FLOOR, observe(MarkerKind::Hoard, 9.0, 0.0, 9.0)).unwrap();
        assert!(applied.write_error.is_none());
        assert_eq!(store.row_count(FLOOR), 2);
        assert_eq!(cache.stats(FLOOR).unwrap().pending_writes, 0);
    }

    #[test]
    fn evict_refuses_while_writes_are_pending() {
        let (store, cache) = make_cache(0.5);
        cache.get_or_load(FLOOR).unwrap();
        store.set_available(false);
        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();

        assert!(cache.evict(FLOOR).is_err());
        assert!(cache.get(FLOOR).is_some());

        store.set_available(true);
        assert!(cache.evict(FLOOR).unwrap());
        assert!(cache.get(FLOOR).is_none());
    }

    // -----------------------------------------------------------------------
    // Eviction races
    // -----------------------------------------------------------------------

    #[test]
    fn evicted_instance_is_never_reused() {
        let (_store, cache) = make_cache(0.5);
        let old = cache.get_or_load(FLOOR).unwrap();

        assert!(cache.evict(FLOOR).unwrap());
        assert_eq!(old.phase(), LoadPhase::Evicted);
        assert!(!cache.evict(FLOOR).unwrap());

        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        let current = cache.get(FLOOR).unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert!(old.snapshot().is_empty());
        assert_eq!(current.snapshot().len(), 1);
    }

    #[test]
    fn applies_racing_evictions_are_all_kept() {
        let (store, cache) = make_cache(0.5);

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..100u32 {
                        cache
                            .apply(
                                FLOOR,
                                observe(MarkerKind::Trap, t as f32 * 1000.0, 0.0, i as f32 * 2.0),
                            )
                            .unwrap();
                    }
                });
            }
            let cache = &cache;
            s.spawn(move || {
                for _ in 0..200 {
                    cache.evict(FLOOR).unwrap();
                    std::thread::yield_now();
                }
            });
        });

        cache.evict(FLOOR).unwrap();
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 400);
        assert_eq!(store.row_count(FLOOR), 400);

        let mut ids: Vec<_> = markers.iter().map(|m| m.local_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }

    // -----------------------------------------------------------------------
    // Floor re-entry
    // -----------------------------------------------------------------------

    #[test]
    fn transient_markers_do_not_survive_reentry() {
        let (_store, cache) = make_cache(0.5);
        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        cache.apply(FLOOR, observe(MarkerKind::Hoard, 5.0, 0.0, 5.0)).unwrap();
        cache
            .apply(FLOOR, observe(MarkerKind::SilverCoffer, 3.0, 0.0, 3.0))
            .unwrap();
        assert_eq!(cache.snapshot(FLOOR).unwrap().len(), 3);

        cache.enter(FLOOR).unwrap();
        let kinds: Vec<_> = cache.snapshot(FLOOR).unwrap().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MarkerKind::Trap, MarkerKind::Hoard]);
    }

    #[test]
    fn permanent_markers_survive_eviction_and_reload() {
        let (store, cache) = make_cache(0.5);
        cache.apply(FLOOR, observe(MarkerKind::Trap, 1.0, 0.0, 1.0)).unwrap();
        cache
            .apply(FLOOR, observe(MarkerKind::SilverCoffer, 3.0, 0.0, 3.0))
            .unwrap();

        assert!(cache.evict(FLOOR).unwrap());
        let markers = cache.snapshot(FLOOR).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].kind, MarkerKind::Trap);
        assert!(markers[0].seen);
        assert_eq!(store.load_count(), 2);
    }

    #[test]
    fn set_visible_replaces_transient_set() {
        let (_store, cache) = make_cache(0.5);
        cache
            .set_visible(
                FLOOR,
                MarkerKind::SilverCoffer,
                &[Vec3::new(1.0, 0.0, 1.0), Vec3::new(8.0, 0.0, 8.0)],
            )
            .unwrap();
        assert_eq!(cache.stats(FLOOR).unwrap().transient, 2);

        cache.set_visible(FLOOR, MarkerKind::SilverCoffer, &[]).unwrap();
        assert_eq!(cache.stats(FLOOR).unwrap().transient, 0);
    }

    #[test]
    fn reset_network_state_clears_connection_fields() {
        let (_store, cache) = make_cache(0.5);
        let pos = Vec3::new(1.0, 0.0, 1.0);
        cache
            .apply(
                FLOOR,
                Mutation::RemoteSync {
                    kind: MarkerKind::Trap,
                    position: pos,
                    network_id: palace_markers::NetworkId(Uuid::from_u128(5)),
                    seen_by: None,
                },
            )
            .unwrap();
        assert!(cache.snapshot(FLOOR).unwrap()[0].network_id.is_some());

        cache.reset_network_state();
        assert!(cache.snapshot(FLOOR).unwrap()[0].network_id.is_none());
    }
}
