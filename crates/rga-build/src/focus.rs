//! Keyboard focus cycling across the build view's regions.
//!
//! The navigator holds an ordered list of active regions plus a list of
//! inactive ones (regions that exist but are not part of the cycle). When the
//! source view is replaced by the build settings or pipeline state editor,
//! cycling switches to a three-step loop: file menu, substituted editor,
//! build output.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    FileMenu,
    SourceView,
    BuildOutput,
    Disassembly,
}

impl RegionKind {
    pub fn default_name(self) -> &'static str {
        match self {
            RegionKind::FileMenu => "file_menu",
            RegionKind::SourceView => "source_view",
            RegionKind::BuildOutput => "build_output",
            RegionKind::Disassembly => "disassembly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub name: String,
    pub hidden: bool,
    pub maximized: bool,
}

impl Region {
    pub fn new(kind: RegionKind) -> Self {
        Self::named(kind, kind.default_name())
    }

    pub fn named(kind: RegionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            hidden: false,
            maximized: false,
        }
    }
}

/// What currently occupies the source view slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentLayer {
    #[default]
    Source,
    BuildSettings,
    PipelineState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubFocus {
    FileMenu,
    Editor,
    BuildOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusTarget {
    None,
    Region(RegionKind),
    InactiveRegion(RegionKind),
    SubstitutedEditor(ContentLayer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSignal {
    EditorFocusIn(ContentLayer),
    EditorFocusOut,
    FrameFocusIn,
    FrameFocusOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusChange {
    pub target: FocusTarget,
    pub signals: Vec<FocusSignal>,
}

#[derive(Debug, Default)]
pub struct FocusNavigator {
    active: Vec<Region>,
    inactive: Vec<Region>,
    focused: Option<usize>,
    inactive_focused: Option<usize>,
    layer: ContentLayer,
    sub: Option<SubFocus>,
}

impl FocusNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&mut self, region: Region, active: bool) {
        if active {
            self.active.push(region);
        } else {
            self.inactive.push(region);
        }
    }

    /// Inserts at `index`, clamped to the list length.
    pub fn insert_region(&mut self, region: Region, active: bool, index: usize) {
        let list = if active { &mut self.active } else { &mut self.inactive };
        let index = index.min(list.len());
        list.insert(index, region);
        if active && let Some(f) = self.focused.as_mut() && *f >= index {
            *f += 1;
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.active
    }

    pub fn region(&self, kind: RegionKind) -> Option<&Region> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .find(|r| r.kind == kind)
    }

    pub fn focused(&self) -> FocusTarget {
        if let Some(i) = self.inactive_focused {
            return FocusTarget::InactiveRegion(self.inactive[i].kind);
        }
        if self.layer != ContentLayer::Source && self.sub == Some(SubFocus::Editor) {
            return FocusTarget::SubstitutedEditor(self.layer);
        }
        match self.focused {
            Some(i) => FocusTarget::Region(self.active[i].kind),
            None => FocusTarget::None,
        }
    }

    pub fn content_layer(&self) -> ContentLayer {
        self.layer
    }

    pub fn set_content_layer(&mut self, layer: ContentLayer) {
        if self.layer != layer {
            self.layer = layer;
            self.sub = self.focused.map(|i| sub_for(self.active[i].kind));
        }
    }

    fn index_of(&self, kind: RegionKind) -> Option<usize> {
        self.active.iter().position(|r| r.kind == kind)
    }

    /// Output log is maximized and holds focus: cycling is suspended.
    fn cycling_blocked(&self) -> bool {
        self.focused.is_none_or(|i| {
            let r = &self.active[i];
            r.kind == RegionKind::BuildOutput && r.maximized
        })
    }

    fn focus_index(&mut self, index: usize, signals: &mut Vec<FocusSignal>) {
        self.focused = Some(index);
        self.inactive_focused = None;
        if self.active[index].kind == RegionKind::Disassembly {
            signals.push(FocusSignal::FrameFocusIn);
        } else {
            signals.push(FocusSignal::FrameFocusOut);
        }
    }

    fn change(&self, signals: Vec<FocusSignal>) -> FocusChange {
        FocusChange {
            target: self.focused(),
            signals,
        }
    }

    pub fn focus_next(&mut self) -> Option<FocusChange> {
        self.step(true)
    }

    pub fn focus_previous(&mut self) -> Option<FocusChange> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Option<FocusChange> {
        if self.cycling_blocked() {
            return None;
        }
        if self.layer != ContentLayer::Source {
            return self.step_substituted(forward);
        }
        let current = self.focused?;
        let len = self.active.len();
        let next = (1..=len)
            .map(|n| {
                if forward {
                    (current + n) % len
                } else {
                    (current + len - n) % len
                }
            })
            .find(|&i| !self.active[i].hidden)?;
        let mut signals = Vec::new();
        self.focus_index(next, &mut signals);
        debug!(region = %self.active[next].name, "focus moved");
        Some(self.change(signals))
    }

    fn step_substituted(&mut self, forward: bool) -> Option<FocusChange> {
        let current = match self.sub {
            Some(sub) => sub,
            None => sub_for(self.active[self.focused?].kind),
        };
        let next = match (current, forward) {
            (SubFocus::FileMenu, true) | (SubFocus::BuildOutput, false) => SubFocus::Editor,
            (SubFocus::Editor, true) | (SubFocus::FileMenu, false) => SubFocus::BuildOutput,
            (SubFocus::BuildOutput, true) | (SubFocus::Editor, false) => SubFocus::FileMenu,
        };
        let mut signals = Vec::new();
        let index = match next {
            // Focus parks on the disassembly slot behind the editor.
            SubFocus::Editor => self.index_of(RegionKind::Disassembly),
            SubFocus::FileMenu => self.index_of(RegionKind::FileMenu),
            SubFocus::BuildOutput => self.index_of(RegionKind::BuildOutput),
        }?;
        if next == SubFocus::Editor {
            self.focused = Some(index);
            self.inactive_focused = None;
            signals.push(FocusSignal::EditorFocusIn(self.layer));
        } else {
            signals.push(FocusSignal::EditorFocusOut);
            self.focus_index(index, &mut signals);
        }
        self.sub = Some(next);
        Some(self.change(signals))
    }

    /// Focuses the region of `kind` if it is in the active list and visible.
    pub fn set_focus(&mut self, kind: RegionKind) -> Option<FocusChange> {
        let index = self.index_of(kind)?;
        if self.active[index].hidden {
            return None;
        }
        let mut signals = Vec::new();
        self.focus_index(index, &mut signals);
        self.sub = Some(sub_for(kind));
        Some(self.change(signals))
    }

    /// Hiding the focused region moves focus to the next visible one, or
    /// clears it when nothing is visible.
    pub fn set_hidden(&mut self, kind: RegionKind, hidden: bool) -> Option<FocusChange> {
        let index = self.index_of(kind)?;
        self.active[index].hidden = hidden;
        if !hidden || self.focused != Some(index) {
            return None;
        }
        let len = self.active.len();
        match (1..len)
            .map(|n| (index + n) % len)
            .find(|&i| !self.active[i].hidden)
        {
            Some(next) => {
                let mut signals = Vec::new();
                self.focus_index(next, &mut signals);
                Some(self.change(signals))
            }
            None => {
                self.focused = None;
                self.sub = None;
                Some(self.change(Vec::new()))
            }
        }
    }

    pub fn set_maximized(&mut self, kind: RegionKind, maximized: bool) {
        if let Some(r) = self
            .active
            .iter_mut()
            .chain(self.inactive.iter_mut())
            .find(|r| r.kind == kind)
        {
            r.maximized = maximized;
        }
    }

    /// Re-syncs after focus moved outside the navigator. `ancestors` are the
    /// names of the newly focused widget's ancestors, innermost first. Hidden
    /// regions never match.
    pub fn handle_focus_changed(&mut self, ancestors: &[&str]) -> FocusChange {
        let find = |list: &[Region]| {
            ancestors.iter().find_map(|name| {
                list.iter().position(|r| r.name == *name && !r.hidden)
            })
        };
        let mut signals = Vec::new();
        if let Some(i) = find(&self.active) {
            self.focus_index(i, &mut signals);
            self.sub = Some(sub_for(self.active[i].kind));
        } else if let Some(i) = find(&self.inactive) {
            // The active index is kept so cycling resumes from where it was.
            self.inactive_focused = Some(i);
            if self.inactive[i].kind != RegionKind::Disassembly {
                signals.push(FocusSignal::FrameFocusOut);
            }
        } else {
            self.focused = None;
            self.inactive_focused = None;
            self.sub = None;
        }
        self.change(signals)
    }

    /// Drops every region; used at shutdown.
    pub fn clear(&mut self) {
        self.active.clear();
        self.inactive.clear();
        self.focused = None;
        self.inactive_focused = None;
        self.sub = None;
    }
}

fn sub_for(kind: RegionKind) -> SubFocus {
    match kind {
        RegionKind::FileMenu => SubFocus::FileMenu,
        RegionKind::BuildOutput => SubFocus::BuildOutput,
        RegionKind::SourceView | RegionKind::Disassembly => SubFocus::Editor,
    }
}
