use rga_build::focus::{ContentLayer, FocusNavigator, FocusTarget, Region, RegionKind};

const ALL: [RegionKind; 4] = [
    RegionKind::FileMenu,
    RegionKind::SourceView,
    RegionKind::Disassembly,
    RegionKind::BuildOutput,
];

fn navigator(hidden: &[RegionKind]) -> FocusNavigator {
    let mut nav = FocusNavigator::new();
    for kind in ALL {
        nav.add_region(Region::new(kind), true);
    }
    for kind in hidden {
        nav.set_hidden(*kind, true);
    }
    nav
}

#[test]
fn n_steps_return_to_start_from_every_visible_region() {
    let layouts: [&[RegionKind]; 4] = [
        &[],
        &[RegionKind::Disassembly],
        &[RegionKind::SourceView, RegionKind::BuildOutput],
        &[RegionKind::FileMenu, RegionKind::SourceView, RegionKind::BuildOutput],
    ];
    for hidden in layouts {
        let visible: Vec<RegionKind> = ALL.into_iter().filter(|k| !hidden.contains(k)).collect();
        for start in &visible {
            for forward in [true, false] {
                let mut nav = navigator(hidden);
                nav.set_focus(*start).expect("focus");
                for _ in 0..visible.len() {
                    let moved = if forward {
                        nav.focus_next()
                    } else {
                        nav.focus_previous()
                    };
                    let target = moved.expect("moved").target;
                    assert!(
                        matches!(target, FocusTarget::Region(k) if !hidden.contains(&k)),
                        "landed on hidden region: {target:?}"
                    );
                }
                assert_eq!(nav.focused(), FocusTarget::Region(*start), "hidden={hidden:?}");
            }
        }
    }
}

#[test]
fn substituted_loop_has_period_three() {
    for layer in [ContentLayer::BuildSettings, ContentLayer::PipelineState] {
        let mut nav = navigator(&[]);
        nav.set_focus(RegionKind::BuildOutput).expect("focus");
        nav.set_content_layer(layer);
        for _ in 0..3 {
            nav.focus_next().expect("moved");
        }
        assert_eq!(nav.focused(), FocusTarget::Region(RegionKind::BuildOutput));

        nav.set_content_layer(ContentLayer::Source);
        nav.focus_next().expect("moved");
        assert_eq!(nav.focused(), FocusTarget::Region(RegionKind::FileMenu));
    }
}
