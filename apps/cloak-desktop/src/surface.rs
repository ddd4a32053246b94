/// The window the user interacts with. Rendering lives elsewhere; the link
/// coordinator only needs to bring it to the front.
pub trait DisplaySurface: Send {
    fn is_minimized(&self) -> bool;
    fn restore(&mut self);
    fn focus(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    Restored,
    Focused,
}

impl SurfaceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restored => "restored",
            Self::Focused => "focused",
        }
    }
}

/// Surface without a window, used when running headless and in tests.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    minimized: bool,
    events: Vec<SurfaceEvent>,
}

impl HeadlessSurface {
    #[cfg(test)]
    pub fn minimized() -> Self {
        Self {
            minimized: true,
            events: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn events(&self) -> &[SurfaceEvent] {
        &self.events
    }

    fn record(&mut self, event: SurfaceEvent) {
        tracing::info!(event = event.as_str(), "display surface");
        self.events.push(event);
    }
}

impl DisplaySurface for HeadlessSurface {
    fn is_minimized(&self) -> bool {
        self.minimized
    }

    fn restore(&mut self) {
        self.minimized = false;
        self.record(SurfaceEvent::Restored);
    }

    fn focus(&mut self) {
        self.record(SurfaceEvent::Focused);
    }
}
