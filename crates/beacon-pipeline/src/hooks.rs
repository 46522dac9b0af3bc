use beacon_core::{EventBuilder, Properties};

use crate::beacon::Beacon;

pub const SCREEN_VIEW_EVENT: &str = "screen_view";
pub const INTERACTION_EVENT: &str = "interaction";

/// Entry points for host UI frameworks that want automatic screen and
/// interaction events.
pub trait InstrumentationHooks {
    fn on_screen_view(&self, screen: &str, properties: Properties);
    fn on_interaction(&self, element: &str, action: &str, properties: Properties);
}

pub fn screen_view_event(screen: &str, properties: Properties) -> EventBuilder {
    EventBuilder::new(SCREEN_VIEW_EVENT)
        .properties(properties)
        .property("screen", screen)
}

pub fn interaction_event(element: &str, action: &str, properties: Properties) -> EventBuilder {
    EventBuilder::new(INTERACTION_EVENT)
        .properties(properties)
        .property("element", element)
        .property("action", action)
}

impl InstrumentationHooks for Beacon {
    fn on_screen_view(&self, screen: &str, properties: Properties) {
        self.track(screen_view_event(screen, properties));
    }

    fn on_interaction(&self, element: &str, action: &str, properties: Properties) {
        self.track(interaction_event(element, action, properties));
    }
}
