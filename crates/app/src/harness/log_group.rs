use std::cell::Cell;

use tracing::info;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A collapsible CI log section. Prints `::group::` on start and `::endgroup::`
/// when dropped. The runner does not nest groups, so only the outermost guard
/// on a thread emits markers.
pub struct LogGroup {
    title: String,
    outermost: bool,
}

impl LogGroup {
    pub fn start(title: impl Into<String>) -> Self {
        let title = title.into();
        let outermost = DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            current == 0
        });
        if outermost {
            println!("{}", start_marker(&title));
        }
        info!(group = %title, "begin");
        Self { title, outermost }
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl Drop for LogGroup {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        info!(group = %self.title, "end");
        if self.outermost {
            println!("{}", end_marker());
        }
    }
}

pub fn start_marker(title: &str) -> String {
    format!("::group::{title}")
}

pub fn end_marker() -> &'static str {
    "::endgroup::"
}

/// Run `f` inside a log group.
pub fn grouped<T>(title: &str, f: impl FnOnce() -> T) -> T {
    let _group = LogGroup::start(title);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth() -> usize {
        DEPTH.with(Cell::get)
    }

    #[test]
    fn markers() {
        assert_eq!(start_marker("Build release"), "::group::Build release");
        assert_eq!(end_marker(), "::endgroup::");
    }

    #[test]
    fn nested_groups_only_mark_the_outermost() {
        let outer = LogGroup::start("outer");
        assert!(outer.outermost);
        {
            let inner = LogGroup::start("inner");
            assert!(!inner.outermost);
            assert_eq!(depth(), 2);
        }
        assert_eq!(depth(), 1);
        drop(outer);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn grouped_returns_the_closure_value() {
        let value = grouped("compute", || 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(depth(), 0);
    }
}
