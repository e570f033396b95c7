/// Placeholder in [`AGENT_JS`] replaced with the page context id before injection.
pub const CONTEXT_PLACEHOLDER: &str = "__STEPGUIDE_CONTEXT__";

/// Name of the CDP binding the agent reports watch events through.
pub const EMIT_BINDING: &str = "stepguideEmit";

/// Reports the document's URL and the id of the agent living in it (0 if none).
/// A document replaced by a full load loses its agent, so the id drops to 0.
pub const PROBE_JS: &str = r#"
JSON.stringify({
  url: location.href,
  context: window.__stepguide ? window.__stepguide.context : 0
})
"#;

/// In-page agent: a node registry plus the primitives a `Page` needs.
///
/// Every call goes through `window.__stepguide.call(method, args)` and returns
/// its result JSON-encoded. Nodes are referred to by numeric ids handed out
/// here; the Rust side never sees a DOM reference. Watches report through the
/// `stepguideEmit` binding as `{context, watch, event}`.
///
/// Installing over an older agent disposes of the old one first, so its
/// listeners and observers stop firing.
pub const AGENT_JS: &str = r#"
(() => {
  if (window.__stepguide) window.__stepguide.dispose();

  const CONTEXT = __STEPGUIDE_CONTEXT__;
  const GUIDE_ID = '__stepguide_guide';
  const LABEL_CSS = 'max-width:260px;padding:8px 12px;font:14px/1.4 system-ui,sans-serif;box-sizing:border-box;';

  const nodes = new Map();
  const ids = new WeakMap();
  const watches = new Map();
  const observed = new Map();
  let nextNode = 1;

  const idOf = node => {
    if (!node) return null;
    let id = ids.get(node);
    if (!id) {
      id = nextNode++;
      ids.set(node, id);
      nodes.set(id, node);
    }
    return id;
  };
  const nodeOf = id => nodes.get(id) || null;
  const rootOf = scope => scope === 'document' ? document : (scope && scope.node ? nodeOf(scope.node) : null);

  const emit = (watch, event) => {
    try {
      window.stepguideEmit(JSON.stringify({ context: CONTEXT, watch, event }));
    } catch (_) {}
  };

  // attachShadow produces no mutation record; report it to the observers
  // whose tree holds the new host. The native method survives reinjection.
  const nativeAttachShadow = window.__stepguideAttachShadow || Element.prototype.attachShadow;
  window.__stepguideAttachShadow = nativeAttachShadow;
  Element.prototype.attachShadow = function (init) {
    const root = nativeAttachShadow.call(this, init);
    observed.forEach((scope, id) => {
      if (scope.contains(this)) emit(id, 'mutated');
    });
    return root;
  };

  const guide = () => {
    let g = document.getElementById(GUIDE_ID);
    if (!g) {
      g = document.createElement('div');
      g.id = GUIDE_ID;
      g.style.cssText = 'position:fixed;inset:0;pointer-events:none;z-index:2147483647;';
      const box = document.createElement('div');
      box.dataset.part = 'box';
      box.style.cssText = 'position:fixed;border:3px solid #2575fc;border-radius:6px;box-shadow:0 0 0 4px rgba(37,117,252,.25);box-sizing:border-box;';
      const label = document.createElement('div');
      label.dataset.part = 'label';
      label.style.cssText = 'position:fixed;background:#2575fc;color:#fff;border-radius:6px;' + LABEL_CSS;
      g.append(box, label);
      document.documentElement.appendChild(g);
    }
    return g;
  };
  const place = (el, r) => Object.assign(el.style, {
    left: r.x + 'px', top: r.y + 'px', width: r.width + 'px', height: r.height + 'px'
  });

  const api = {
    url: () => location.href,
    query: ([scope, selector]) => {
      const root = rootOf(scope);
      if (!root || !root.querySelector) return null;
      try {
        return idOf(root.querySelector(selector));
      } catch (_) {
        return null;
      }
    },
    shadow_root: ([id]) => {
      const n = nodeOf(id);
      return n && n.shadowRoot ? idOf(n.shadowRoot) : null;
    },
    is_connected: ([id]) => {
      const n = nodeOf(id);
      return !!(n && n.isConnected);
    },
    value: ([id]) => {
      const n = nodeOf(id);
      return n && 'value' in n ? String(n.value) : null;
    },
    text_content: ([id]) => {
      const n = nodeOf(id);
      return n ? n.textContent : null;
    },
    link_target: ([id]) => {
      const n = nodeOf(id);
      return n && n.tagName === 'A' && n.href ? n.href : null;
    },
    bounding_rect: ([id]) => {
      const n = nodeOf(id);
      if (!n || !n.isConnected || !n.getBoundingClientRect) return null;
      const r = n.getBoundingClientRect();
      return { x: r.left, y: r.top, width: r.width, height: r.height };
    },
    viewport: () => ({ width: window.innerWidth, height: window.innerHeight }),
    watch: ([id, spec]) => {
      let stop = () => {};
      if (spec.type === 'events') {
        const n = nodeOf(spec.node);
        if (!n) return null;
        const handlers = spec.kinds.map(kind => {
          const handler = e => {
            if (kind === 'click' && spec.suppress_navigation) e.preventDefault();
            emit(id, kind);
          };
          n.addEventListener(kind, handler, true);
          return [kind, handler];
        });
        stop = () => handlers.forEach(([kind, handler]) => n.removeEventListener(kind, handler, true));
      } else if (spec.type === 'mutations') {
        const root = rootOf(spec.scope);
        if (!root) return null;
        const observer = new MutationObserver(() => emit(id, 'mutated'));
        observer.observe(root, { childList: true, subtree: true, characterData: !!spec.character_data });
        observed.set(id, root);
        stop = () => {
          observer.disconnect();
          observed.delete(id);
        };
      } else if (spec.type === 'frames') {
        let live = true;
        const tick = () => {
          if (!live) return;
          emit(id, 'frame');
          requestAnimationFrame(tick);
        };
        requestAnimationFrame(tick);
        stop = () => { live = false; };
      }
      watches.set(id, stop);
      return null;
    },
    unwatch: ([id]) => {
      const stop = watches.get(id);
      if (stop) {
        stop();
        watches.delete(id);
      }
      return null;
    },
    measure_label: ([text]) => {
      const probe = document.createElement('div');
      probe.style.cssText = 'position:fixed;left:0;top:0;visibility:hidden;' + LABEL_CSS;
      probe.textContent = text;
      document.documentElement.appendChild(probe);
      const r = probe.getBoundingClientRect();
      probe.remove();
      return { width: r.width, height: r.height };
    },
    draw_guide: ([frame]) => {
      const g = guide();
      g.style.display = 'block';
      place(g.querySelector('[data-part=box]'), frame.highlight);
      const label = g.querySelector('[data-part=label]');
      if (label.textContent !== frame.text) label.textContent = frame.text;
      place(label, frame.label);
      return null;
    },
    hide_guide: () => {
      const g = document.getElementById(GUIDE_ID);
      if (g) g.style.display = 'none';
      return null;
    },
    remove_guide: () => {
      const g = document.getElementById(GUIDE_ID);
      if (g) g.remove();
      return null;
    },
  };

  window.__stepguide = {
    context: CONTEXT,
    call: (method, args) => {
      const f = api[method];
      const result = f ? f(args || []) : null;
      return JSON.stringify(result === undefined ? null : result);
    },
    dispose: () => {
      watches.forEach(stop => stop());
      watches.clear();
      Element.prototype.attachShadow = nativeAttachShadow;
      api.remove_guide();
    },
  };
  return CONTEXT;
})()
"#;

/// The agent script for one page context.
pub fn agent_script(context: u64) -> String {
    AGENT_JS.replace(CONTEXT_PLACEHOLDER, &context.to_string())
}
