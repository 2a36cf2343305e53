#![forbid(unsafe_code)]

//! `wasm-bindgen` exports and the `web-sys` render adapter.
//!
//! [`DomAdapter`] maps [`NodeId`]s to live elements by stamping a
//! `data-unloader-id` attribute on every element it hands out. [`WebUnloader`]
//! wraps a [`VisibilityScheduler`] over that adapter and a [`CommandQueue`];
//! the JS glue applies drained commands and feeds observer callbacks back
//! through `dispatch`. Only compiled on `wasm32` targets.

use std::cell::RefCell;
use std::collections::HashMap;

use js_sys::{Function, Reflect};
use serde::Serialize;
use unloader_core::codec::DORMANT_SRC_ATTR;
use unloader_core::{
    NodeId, PLACEHOLDER_ATTR, RenderAdapter, RenderError, Settings, SetupOutcome,
    UnloaderConfig, VisibilityScheduler,
};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Document, Element, HtmlElement, Node};

use crate::commands::{CommandQueue, decode_events};

const ID_ATTR: &str = "data-unloader-id";
const RESOURCE_SELECTOR: &str = "img[src], iframe[src], video[src], audio[src], source[src]";

fn js_err(err: JsValue) -> RenderError {
    RenderError::Host(err.as_string().unwrap_or_else(|| format!("{err:?}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value).map_err(|e| JsValue::from_str(&e.to_string()))
}

// ---------------------------------------------------------------------------
// Render adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HandleTable {
    by_id: HashMap<NodeId, Element>,
    next_id: u64,
}

/// [`RenderAdapter`] over the live browser document.
#[derive(Debug)]
pub struct DomAdapter {
    document: Document,
    handles: RefCell<HandleTable>,
    container_selectors: Vec<String>,
    entry_selector: String,
}

impl DomAdapter {
    pub fn new(document: Document, config: &UnloaderConfig) -> Self {
        Self {
            document,
            handles: RefCell::new(HandleTable {
                by_id: HashMap::new(),
                next_id: 1,
            }),
            container_selectors: config.container_selectors.clone(),
            entry_selector: config.entry_selector.clone(),
        }
    }

    /// Stable handle for `element`, allocating one on first sight.
    pub fn handle(&self, element: &Element) -> NodeId {
        let mut table = self.handles.borrow_mut();
        if let Some(id) = element
            .get_attribute(ID_ATTR)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(NodeId)
            && table
                .by_id
                .get(&id)
                .is_some_and(|known| known.is_same_node(Some(&**element)))
        {
            return id;
        }
        let id = NodeId(table.next_id);
        table.next_id += 1;
        let _ = element.set_attribute(ID_ATTR, &id.0.to_string());
        table.by_id.insert(id, element.clone());
        id
    }

    #[must_use]
    pub fn element(&self, node: NodeId) -> Option<Element> {
        self.handles.borrow().by_id.get(&node).cloned()
    }

    fn require(&self, node: NodeId) -> Result<Element, RenderError> {
        self.element(node).ok_or(RenderError::MissingNode(node))
    }

    fn move_attr(&self, node: NodeId, selector: &str, from: &str, to: &str) -> usize {
        let Some(root) = self.element(node) else {
            return 0;
        };
        let Ok(list) = root.query_selector_all(selector) else {
            return 0;
        };
        let mut moved = 0;
        for i in 0..list.length() {
            let Some(el) = list.item(i).and_then(|n| n.dyn_into::<Element>().ok()) else {
                continue;
            };
            if let Some(value) = el.get_attribute(from)
                && el.set_attribute(to, &value).is_ok()
                && el.remove_attribute(from).is_ok()
            {
                moved += 1;
            }
        }
        moved
    }
}

impl RenderAdapter for DomAdapter {
    fn find_container(&self) -> Option<NodeId> {
        self.container_selectors.iter().find_map(|selector| {
            self.document
                .query_selector(selector)
                .ok()
                .flatten()
                .map(|el| self.handle(&el))
        })
    }

    fn entries_within(&self, root: NodeId) -> Vec<NodeId> {
        let Some(root) = self.element(root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if root.matches(&self.entry_selector).unwrap_or(false) {
            out.push(self.handle(&root));
        }
        if let Ok(list) = root.query_selector_all(&self.entry_selector) {
            for i in 0..list.length() {
                if let Some(el) = list.item(i).and_then(|n| n.dyn_into::<Element>().ok()) {
                    out.push(self.handle(&el));
                }
            }
        }
        out
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.element(node)?.get_attribute(name)
    }

    fn rendered_height(&self, node: NodeId) -> Option<f64> {
        let el = self.element(node)?;
        el.is_connected()
            .then(|| el.get_bounding_client_rect().height())
    }

    fn inner_markup(&self, node: NodeId) -> Option<String> {
        Some(self.element(node)?.inner_html())
    }

    fn text_content(&self, node: NodeId) -> Option<String> {
        self.element(node)?.text_content()
    }

    fn subtree_node_count(&self, node: NodeId) -> usize {
        self.element(node).map_or(0, |el| {
            1 + el
                .query_selector_all("*")
                .map_or(0, |list| list.length() as usize)
        })
    }

    fn document_node_count(&self) -> usize {
        self.document
            .query_selector_all("*")
            .map_or(0, |list| list.length() as usize)
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.element(node).is_some_and(|el| el.is_connected())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.element(node)?.parent_element()?;
        Some(self.handle(&parent))
    }

    fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let sibling = self.element(node)?.next_element_sibling()?;
        Some(self.handle(&sibling))
    }

    fn create_placeholder(&mut self, height: f64) -> Result<NodeId, RenderError> {
        let el = self.document.create_element("div").map_err(js_err)?;
        el.set_attribute(PLACEHOLDER_ATTR, "").map_err(js_err)?;
        let html: HtmlElement = el
            .clone()
            .dyn_into()
            .map_err(|_| RenderError::Host("placeholder is not an HTMLElement".into()))?;
        let style = html.style();
        style
            .set_property("height", &format!("{height}px"))
            .map_err(js_err)?;
        style.set_property("contain", "strict").map_err(js_err)?;
        Ok(self.handle(&el))
    }

    fn set_inner_markup(&mut self, node: NodeId, markup: &str) -> Result<(), RenderError> {
        self.require(node)?.set_inner_html(markup);
        Ok(())
    }

    fn replace_children(&mut self, node: NodeId, child: NodeId) -> Result<(), RenderError> {
        let el = self.require(node)?;
        let child = self.require(child)?;
        el.set_inner_html("");
        el.append_child(&child).map_err(js_err)?;
        Ok(())
    }

    fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<(), RenderError> {
        let old_el = self.require(old)?;
        let new_el = self.require(new)?;
        if old_el.parent_node().is_none() {
            return Err(RenderError::Detached(old));
        }
        old_el.replace_with_with_node_1(&new_el).map_err(js_err)
    }

    fn insert_before(
        &mut self,
        parent: NodeId,
        node: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), RenderError> {
        let parent = self.require(parent)?;
        let node = self.require(node)?;
        let reference = reference.and_then(|r| self.element(r));
        let reference: Option<&Node> = reference.as_deref();
        parent.insert_before(&node, reference).map_err(js_err)?;
        Ok(())
    }

    fn release(&mut self, node: NodeId) {
        if let Some(el) = self.handles.borrow_mut().by_id.remove(&node) {
            el.remove();
        }
    }

    fn release_detached(&mut self, keep: &dyn Fn(NodeId) -> bool) -> usize {
        let mut table = self.handles.borrow_mut();
        let before = table.by_id.len();
        table
            .by_id
            .retain(|id, el| el.is_connected() || keep(*id));
        before - table.by_id.len()
    }

    fn set_size_hints(&mut self, node: NodeId, height: Option<f64>) {
        let Some(html) = self
            .element(node)
            .and_then(|el| el.dyn_into::<HtmlElement>().ok())
        else {
            return;
        };
        let style = html.style();
        match height {
            Some(h) => {
                let _ = style.set_property("min-height", &format!("{h}px"));
                let _ = style.set_property("contain", "size layout paint");
            }
            None => {
                let _ = style.remove_property("min-height");
                let _ = style.remove_property("contain");
            }
        }
    }

    fn defer_resources(&mut self, node: NodeId) -> usize {
        self.move_attr(node, RESOURCE_SELECTOR, "src", DORMANT_SRC_ATTR)
    }

    fn resume_resources(&mut self, node: NodeId) -> usize {
        let selector = format!("[{DORMANT_SRC_ATTR}]");
        self.move_attr(node, &selector, DORMANT_SRC_ATTR, "src")
    }

    fn request_memory_reclaim(&mut self) -> Result<(), RenderError> {
        let gc = Reflect::get(&js_sys::global(), &JsValue::from_str("gc")).map_err(js_err)?;
        let gc = gc
            .dyn_into::<Function>()
            .map_err(|_| RenderError::Host("gc is not exposed".into()))?;
        gc.call0(&JsValue::NULL).map_err(js_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JS surface
// ---------------------------------------------------------------------------

type Session = VisibilityScheduler<DomAdapter, CommandQueue>;

/// One virtualization session bound to the current document.
#[wasm_bindgen]
pub struct WebUnloader {
    session: Option<Session>,
}

impl WebUnloader {
    fn session(&mut self) -> Result<&mut Session, JsValue> {
        self.session
            .as_mut()
            .ok_or_else(|| JsValue::from_str("session disposed"))
    }

    fn session_ref(&self) -> Result<&Session, JsValue> {
        self.session
            .as_ref()
            .ok_or_else(|| JsValue::from_str("session disposed"))
    }
}

#[wasm_bindgen]
impl WebUnloader {
    /// `config` is optional engine tuning as JSON; `settings` is the stored
    /// `{enabled, bufferSize}` object as JSON.
    #[wasm_bindgen(constructor)]
    pub fn new(config: Option<String>, settings: Option<String>) -> Result<WebUnloader, JsValue> {
        let config = match config.as_deref() {
            Some(json) => UnloaderConfig::from_json_str(json)
                .map_err(|e| JsValue::from_str(&e.to_string()))?,
            None => UnloaderConfig::default(),
        };
        let settings = match settings.as_deref() {
            Some(json) => {
                Settings::from_json_str(json).map_err(|e| JsValue::from_str(&e.to_string()))?
            }
            None => Settings::default(),
        };
        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| JsValue::from_str("no document"))?;
        let dom = DomAdapter::new(document, &config);
        Ok(Self {
            session: Some(VisibilityScheduler::new(dom, CommandQueue::new(), config, settings)),
        })
    }

    /// Returns `"started"`, `"containerNotFound"` or `"alreadyStarted"`.
    pub fn start(&mut self) -> Result<String, JsValue> {
        let outcome = match self.session()?.start() {
            SetupOutcome::Started { .. } => "started",
            SetupOutcome::ContainerNotFound => "containerNotFound",
            SetupOutcome::AlreadyStarted => "alreadyStarted",
        };
        Ok(outcome.to_owned())
    }

    /// Feed one event object or an array of events as a single batch.
    pub fn dispatch(&mut self, events: &str) -> Result<(), JsValue> {
        let events = decode_events(events).map_err(|e| JsValue::from_str(&e.to_string()))?;
        self.session()?.dispatch_batch(events);
        Ok(())
    }

    /// Pending host commands as a JSON array, oldest first.
    #[wasm_bindgen(js_name = drainCommands)]
    pub fn drain_commands(&mut self) -> Result<String, JsValue> {
        self.session()?
            .host_mut()
            .drain_json()
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// Element behind a handle, for the glue's observer calls.
    pub fn element(&self, id: f64) -> Option<Element> {
        self.session.as_ref()?.dom().element(NodeId(id as u64))
    }

    /// Handle of an element, allocating one if needed.
    #[wasm_bindgen(js_name = nodeId)]
    pub fn node_id(&self, element: &Element) -> Option<f64> {
        let session = self.session.as_ref()?;
        Some(session.dom().handle(element).0 as f64)
    }

    /// Apply `{enabled, bufferSize}` and return the change as JSON.
    #[wasm_bindgen(js_name = applySettings)]
    pub fn apply_settings(&mut self, settings: &str) -> Result<String, JsValue> {
        let settings =
            Settings::from_json_str(settings).map_err(|e| JsValue::from_str(&e.to_string()))?;
        let change = self.session()?.apply_settings(settings);
        to_json(&change)
    }

    pub fn stats(&self) -> Result<String, JsValue> {
        to_json(&self.session_ref()?.stats())
    }

    #[wasm_bindgen(js_name = memoryHistory)]
    pub fn memory_history(&self) -> Result<String, JsValue> {
        to_json(&self.session_ref()?.history())
    }

    #[wasm_bindgen(js_name = extractContent)]
    pub fn extract_content(&self, id: f64) -> Result<String, JsValue> {
        Ok(self.session_ref()?.extract_content(NodeId(id as u64)))
    }

    #[wasm_bindgen(js_name = extractAll)]
    pub fn extract_all(&self) -> Result<String, JsValue> {
        to_json(&self.session_ref()?.extract_all())
    }

    #[wasm_bindgen(js_name = conversationStats)]
    pub fn conversation_stats(&self) -> Result<String, JsValue> {
        to_json(&self.session_ref()?.conversation_stats())
    }

    /// Collapse everything not currently in view. Rejects with a message the
    /// popup can show when the session is disabled or not started.
    #[wasm_bindgen(js_name = forceOptimize)]
    pub fn force_optimize(&mut self) -> Result<String, JsValue> {
        let report = self
            .session()?
            .force_optimize()
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        to_json(&report)
    }

    #[wasm_bindgen(js_name = resetConversation)]
    pub fn reset_conversation(&mut self) -> Result<bool, JsValue> {
        let outcome = self.session()?.reset_conversation();
        Ok(matches!(outcome, SetupOutcome::Started { .. }))
    }

    /// `callback(progressJson)` at every ingestion chunk boundary.
    #[wasm_bindgen(js_name = onProgress)]
    pub fn on_progress(&mut self, callback: Function) -> Result<(), JsValue> {
        self.session()?.on_progress(move |progress| {
            if let Ok(json) = serde_json::to_string(&progress) {
                let _ = callback.call1(&JsValue::NULL, &JsValue::from_str(&json));
            }
        });
        Ok(())
    }

    /// `callback(statsJson)` after any batch that moved the counts.
    #[wasm_bindgen(js_name = onStatsChange)]
    pub fn on_stats_change(&mut self, callback: Function) -> Result<(), JsValue> {
        self.session()?.on_stats_change(move |stats| {
            if let Ok(json) = serde_json::to_string(stats) {
                let _ = callback.call1(&JsValue::NULL, &JsValue::from_str(&json));
            }
        });
        Ok(())
    }

    /// Restore the document and release the session. Returns the final
    /// commands the glue must apply to tear down its observers.
    pub fn dispose(&mut self) -> Result<String, JsValue> {
        let session = self
            .session
            .take()
            .ok_or_else(|| JsValue::from_str("session disposed"))?;
        let (_dom, mut host) = session.dispose();
        host.drain_json()
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }
}
