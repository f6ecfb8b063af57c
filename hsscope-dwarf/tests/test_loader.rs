//! DWARFローダーとホスト問い合わせのテスト
//!
//! テストバイナリ自身を読み込み、実行中のアドレスで問い合わせる。

use hsscope_dwarf::{DebugInfoSource, DebugSymbols, DwarfLoader, SymbolResolver, TypeLayouts};
use std::hint::black_box;

#[repr(C)]
pub struct HsscopeProbe {
    tag: u32,
    value: u64,
}

#[inline(never)]
#[no_mangle]
pub extern "C" fn hsscope_marker_function(probe: &HsscopeProbe) -> u64 {
    black_box(probe.value) + u64::from(black_box(probe.tag))
}

fn load_self() -> DwarfLoader {
    let exe = std::env::current_exe().expect("current_exe");
    DwarfLoader::load(exe).expect("Failed to load DWARF from the test binary")
}

#[test]
fn test_symbols_of_test_binary() {
    let loader = load_self();
    assert!(loader.has_debug_info());

    let resolver = SymbolResolver::new(&loader).expect("Failed to create symbol resolver");
    let marker = resolver
        .resolve("hsscope_marker_function")
        .expect("marker symbol");

    let found = resolver.find_symbols("hsscope_marker");
    assert!(found.iter().any(|s| s.address == marker));

    let sym = resolver.reverse_resolve(marker).expect("reverse resolve");
    assert_eq!(sym.name, "hsscope_marker_function");
}

#[test]
fn test_queries_at_runtime_address() {
    let probe = HsscopeProbe { tag: 1, value: 41 };
    assert_eq!(hsscope_marker_function(&probe), 42);

    let loader = load_self();
    let runtime = hsscope_marker_function as usize as u64;
    let link = SymbolResolver::new(&loader)
        .expect("symbols")
        .resolve("hsscope_marker_function")
        .expect("marker symbol");

    let debug = DebugSymbols::load(&loader)
        .expect("debug symbols")
        .with_load_bias(runtime - link);

    assert_eq!(debug.global_address("hsscope_marker_function"), Some(runtime));
    assert_eq!(debug.symbol_at(runtime).as_deref(), Some("hsscope_marker_function"));

    let chain = debug.scope_chain(runtime);
    let innermost = chain.first().expect("scope chain");
    assert_eq!(innermost.low_pc, runtime);
    assert!(innermost
        .name
        .as_deref()
        .is_some_and(|n| n.contains("hsscope_marker_function")));

    let line = debug.line_at(runtime).expect("line info");
    assert!(line.file.as_deref().is_some_and(|f| f.ends_with("test_loader.rs")));

    let rows = debug.line_table(runtime);
    assert!(rows.iter().any(|r| r.address >= runtime));
}

#[test]
fn test_extract_struct_layout() {
    let loader = load_self();
    let layouts = TypeLayouts::extract(loader.dwarf(), &["HsscopeProbe"]).expect("extract");

    let probe = layouts.get("HsscopeProbe").expect("HsscopeProbe layout");
    assert_eq!(probe.size, 16);
    assert_eq!(probe.field("tag").map(|f| (f.offset, f.size)), Some((0, 4)));
    assert_eq!(probe.field("value").map(|f| (f.offset, f.size)), Some((8, 8)));
}
