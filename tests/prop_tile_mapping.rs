// Property: a client window always maps onto exactly one aligned tile that
// contains the first requested byte, and the served window never leaves it.

use proptest::prelude::*;
use tile_proxy::{ProxyError, RangeRequest, RangeTiler};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_window_stays_inside_one_tile(
        tile_size in 1u64..=8_388_608u64,
        total in 1u64..=1_000_000_000u64,
        start_fraction in 0.0f64..1.0f64,
        span in proptest::option::of(0u64..=20_000_000u64),
    ) {
        let tiler = RangeTiler::new(tile_size);
        let start = ((total as f64) * start_fraction) as u64;
        let start = start.min(total - 1);
        let range = RangeRequest { start, end: span.map(|s| start + s) };

        let window = tiler.window(range, Some(total)).unwrap();

        // Tile alignment
        prop_assert_eq!(window.tile.range.start % tile_size, 0);
        prop_assert_eq!(window.tile.index, start / tile_size);
        prop_assert_eq!(window.tile.range.start, window.tile.index * tile_size);

        // The tile never passes the object end and is at most one tile long
        prop_assert!(window.tile.range.end < total);
        prop_assert!(window.tile.range.size() <= tile_size);

        // The served window starts at the request and stays within the tile
        prop_assert_eq!(window.request_start, start);
        prop_assert!(window.tile.range.start <= window.request_start);
        prop_assert!(window.request_start <= window.response_end);
        prop_assert!(window.response_end <= window.tile.range.end);
        if let Some(end) = range.end {
            prop_assert!(window.response_end <= end);
        }
    }

    #[test]
    fn prop_start_past_end_is_unsatisfiable(
        tile_size in 1u64..=8_388_608u64,
        total in 0u64..=1_000_000_000u64,
        beyond in 0u64..=1_000_000u64,
    ) {
        let tiler = RangeTiler::new(tile_size);
        let range = RangeRequest { start: total + beyond, end: None };

        match tiler.window(range, Some(total)) {
            Err(ProxyError::UnsatisfiableRange { start, total: reported }) => {
                prop_assert_eq!(start, total + beyond);
                prop_assert_eq!(reported, total);
            }
            other => prop_assert!(false, "expected UnsatisfiableRange, got {:?}", other),
        }
    }

    #[test]
    fn prop_unknown_size_serves_full_tile(
        tile_size in 1u64..=8_388_608u64,
        start in 0u64..=1_000_000_000u64,
    ) {
        let tiler = RangeTiler::new(tile_size);
        let window = tiler.window(RangeRequest { start, end: None }, None).unwrap();

        prop_assert_eq!(window.tile.range.size(), tile_size);
        prop_assert_eq!(window.response_end, window.tile.range.end);
        prop_assert_eq!(window.total_size, None);
    }

    #[test]
    fn prop_tiles_cover_object(
        tile_size in 1u64..=4_194_304u64,
        total in 1u64..=200_000_000u64,
    ) {
        let tiler = RangeTiler::new(tile_size);
        let (last_index, last_start) = tiler.tile_for(total - 1);

        prop_assert_eq!(last_start, last_index * tile_size);
        prop_assert!(last_start < total);
        prop_assert!(last_start + tile_size >= total);
        prop_assert_eq!(tiler.tile_end(last_start, Some(total)), total - 1);
    }
}
