//! Built-in mapping document.

use std::collections::BTreeMap;

use deckhost_core::{
    Action, EventMode, Key, MappingStructure, Profile, DEFAULT_PROFILE, MAPPING_VERSION,
    SERVER_SOURCE,
};

use EventMode::*;

fn key(id: &str, description: &str, modes: &[EventMode]) -> Key {
    let mut key = Key::new(id, SERVER_SOURCE, modes.to_vec());
    key.description = Some(description.to_string());
    key
}

fn action(id: &str, name: &str, description: &str) -> Action {
    let mut action = Action::new(id, SERVER_SOURCE).with_name(name);
    action.description = Some(description.to_string());
    action.version = Some(MAPPING_VERSION.to_string());
    action
}

const PRESS_MODES: &[EventMode] = &[PressShort, PressLong, KeyDown, KeyUp];
const SCROLL_MODES: &[EventMode] = &[ScrollUp, ScrollDown, ScrollLeft, ScrollRight];
const SWIPE_MODES: &[EventMode] = &[SwipeUp, SwipeDown, SwipeLeft, SwipeRight];

/// Keys the host itself provides.
pub fn default_keys() -> Vec<Key> {
    let mut keys = Vec::new();
    for n in 1..=4 {
        keys.push(key(
            &format!("DynamicAction{}", n),
            &format!("Dynamic action button {} on the miniplayer", n),
            &[KeyDown],
        ));
    }
    for n in 5..=7 {
        keys.push(key(
            &format!("Action{}", n),
            &format!("Action button {} on the miniplayer", n),
            &[KeyDown],
        ));
    }
    for n in 1..=4 {
        keys.push(key(
            &format!("Digit{}", n),
            &format!("Physical button {}", n),
            PRESS_MODES,
        ));
    }
    keys.push(key("KeyM", "Physical button M", PRESS_MODES));
    keys.push(key("Scroll", "Physical scroll wheel", SCROLL_MODES));
    keys.push(key("Enter", "Physical button Enter", PRESS_MODES));
    keys.push(key("Escape", "Physical button Escape", PRESS_MODES));
    keys.push(key("Swipe", "Touchpad swipe", SWIPE_MODES));
    for n in 1..=9 {
        keys.push(key(
            &format!("Pad{}", n),
            &format!("Touch pad {} on the fullscreen miniplayer", n),
            &[KeyDown],
        ));
    }
    keys
}

/// Actions the host itself provides.
pub fn default_actions() -> Vec<Action> {
    let mut shuffle = action("shuffle", "Shuffle", "Shuffles the song").with_value("toggle");
    shuffle.value_options = vec!["off".into(), "toggle".into(), "on".into()];

    let mut rewind = action("rewind", "Rewind", "Rewinds the song").with_value("rewind");
    rewind.value_options = vec!["rewind".into(), "stop".into()];

    let mut play = action("play", "PlayPause", "Plays or pauses the song");
    play.icon = Some("play".to_string());

    let mut apps_list =
        action("appsList", "Toggle AppsList", "Toggles the apps list").with_value("hide");
    apps_list.value_options = vec!["hide".into(), "toggle".into(), "show".into()];

    vec![
        shuffle,
        rewind,
        play,
        action("skip", "Skip", "Skips the song"),
        action("repeat", "Repeat", "Toggles repeat"),
        action("pref", "Preference", "Opens the app at a preference index").with_value("0"),
        action("swap", "Swap", "Swaps the current app with a preference index").with_value("0"),
        action("volDown", "Volume Down", "Turns the volume down").with_value("15"),
        action("volUp", "Volume Up", "Turns the volume up").with_value("15"),
        action("open", "Open App", "Opens an app by id").with_value("dashboard"),
        apps_list,
        action("swipeL", "Open Previous", "Opens the app at the previous index"),
        action("swipeR", "Open Next", "Opens the app at the next index"),
        action("hidden", "Hidden", "Does nothing and hides the button"),
        action("fullscreen", "Fullscreen", "Toggles fullscreen on most devices"),
    ]
}

/// The protected `default` profile.
pub fn default_profile(catalog: &[Action]) -> Profile {
    let mut profile = Profile::new(DEFAULT_PROFILE);
    profile.name = "The Default Mapping".to_string();
    profile.description = Some("The default mapping for the device".to_string());

    let mut bind = |key: &str, mode: EventMode, id: &str, value: Option<&str>| {
        let Some(mut bound) = catalog.iter().find(|a| a.id == id).cloned() else {
            return;
        };
        if let Some(value) = value {
            bound.value = Some(value.to_string());
        }
        profile
            .mapping
            .entry(key.to_string())
            .or_insert_with(BTreeMap::new)
            .insert(mode, bound);
    };

    bind("Pad1", KeyDown, "volUp", None);
    bind("Pad2", KeyDown, "swipeL", None);
    bind("Pad3", KeyDown, "swipeR", None);
    bind("Pad4", KeyDown, "volDown", None);
    bind("Pad5", KeyDown, "appsList", Some("hide"));
    bind("Pad6", KeyDown, "appsList", Some("show"));
    bind("Pad7", KeyDown, "repeat", None);
    bind("Pad8", KeyDown, "play", None);
    bind("Pad9", KeyDown, "fullscreen", None);

    bind("DynamicAction1", KeyDown, "shuffle", Some("toggle"));
    bind("DynamicAction2", KeyDown, "repeat", None);
    bind("DynamicAction3", KeyDown, "rewind", Some("stop"));
    bind("DynamicAction4", KeyDown, "hidden", None);
    bind("Action5", KeyDown, "hidden", None);
    bind("Action6", KeyDown, "play", None);
    bind("Action7", KeyDown, "skip", None);

    for (n, key) in ["Digit1", "Digit2", "Digit3", "Digit4"].iter().enumerate() {
        let index = n.to_string();
        bind(*key, PressShort, "pref", Some(index.as_str()));
        bind(*key, PressLong, "swap", Some(index.as_str()));
    }

    bind("KeyM", PressShort, "open", Some("dashboard"));
    bind("KeyM", PressLong, "open", Some("utility"));

    bind("Scroll", ScrollRight, "volUp", None);
    bind("Scroll", ScrollUp, "volUp", None);
    bind("Scroll", ScrollLeft, "volDown", None);
    bind("Scroll", ScrollDown, "volDown", None);

    bind("Enter", KeyDown, "play", None);
    bind("Enter", PressLong, "skip", None);

    bind("Escape", PressShort, "appsList", Some("show"));
    bind("Escape", PressLong, "appsList", Some("hide"));

    bind("Swipe", SwipeUp, "appsList", Some("hide"));
    bind("Swipe", SwipeDown, "appsList", Some("show"));
    bind("Swipe", SwipeLeft, "swipeL", None);
    bind("Swipe", SwipeRight, "swipeR", None);

    profile
}

/// The whole built-in document.
pub fn default_structure() -> MappingStructure {
    let actions = default_actions();
    let profile = default_profile(&actions);

    let mut profiles = BTreeMap::new();
    profiles.insert(DEFAULT_PROFILE.to_string(), profile);

    MappingStructure {
        version: MAPPING_VERSION.to_string(),
        selected_profile: DEFAULT_PROFILE.to_string(),
        profiles,
        actions,
        keys: default_keys(),
    }
}
