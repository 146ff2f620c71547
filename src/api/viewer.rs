//! Embedded browser viewer served on `GET /`.
//!
//! The script polls `/api/frame` once per animation frame, treats 204 as
//! "nothing yet", and backs off for 500 ms after a transport failure.

pub const VIEWER_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Edge Relay Viewer</title>
<style>
  body { font-family: system-ui, sans-serif; background: #111; color: #eee; margin: 0; padding: 16px; }
  main { max-width: 960px; margin: 0 auto; }
  canvas { width: 100%; background: #000; border-radius: 6px; display: block; }
  .bar { display: flex; gap: 8px; flex-wrap: wrap; margin: 12px 0; }
  button { padding: 8px 14px; border: 0; border-radius: 4px; background: #2e7d32; color: #fff; cursor: pointer; }
  button:disabled { background: #555; cursor: default; }
  .stats { display: grid; grid-template-columns: repeat(auto-fit, minmax(140px, 1fr)); gap: 8px; }
  .stats div { background: #222; padding: 8px; border-radius: 4px; }
  .stats span { float: right; font-variant-numeric: tabular-nums; }
</style>
</head>
<body>
<main>
  <h1>Edge Relay</h1>
  <canvas id="frame" width="640" height="480"></canvas>
  <div class="bar">
    <button id="start">Start</button>
    <button id="stop" disabled>Stop</button>
    <button data-filter="grayscale">Grayscale</button>
    <button data-filter="edge_detect">Edges</button>
    <button data-filter="passthrough">Original</button>
  </div>
  <div class="stats">
    <div>Status <span id="status">Connecting...</span></div>
    <div>FPS <span id="fps">0</span></div>
    <div>Peak FPS <span id="peak">0</span></div>
    <div>Latency ms <span id="latency">0</span></div>
    <div>Rendered <span id="rendered">0</span></div>
  </div>
</main>
<script>
(() => {
  const BACKOFF_MS = 500;
  const canvas = document.getElementById('frame');
  const ctx = canvas.getContext('2d');
  const el = (id) => document.getElementById(id);
  const state = { streaming: false, windowFrames: 0, windowStart: performance.now() };
  const metrics = { fetched: 0, rendered: 0, total: 0, avgLatency: 0, fps: 0, peakFps: 0 };
  const nextPaint = () => new Promise((resolve) => requestAnimationFrame(resolve));
  const sleep = (ms) => new Promise((resolve) => setTimeout(resolve, ms));

  async function fetchFrame() {
    const response = await fetch('/api/frame', {
      cache: 'no-store',
      headers: { 'Cache-Control': 'no-cache', 'Pragma': 'no-cache' },
    });
    if (response.status === 204) return null;
    if (response.status !== 200) throw new Error('HTTP ' + response.status);
    metrics.fetched++;
    return createImageBitmap(await response.blob());
  }

  function record(latency) {
    metrics.total++;
    metrics.avgLatency += (latency - metrics.avgLatency) / metrics.total;
    state.windowFrames++;
    const now = performance.now();
    const elapsed = now - state.windowStart;
    if (elapsed >= 1000) {
      metrics.fps = state.windowFrames * 1000 / elapsed;
      metrics.peakFps = Math.max(metrics.peakFps, metrics.fps);
      state.windowFrames = 0;
      state.windowStart = now;
    }
    el('fps').textContent = metrics.fps.toFixed(1);
    el('peak').textContent = metrics.peakFps.toFixed(1);
    el('latency').textContent = metrics.avgLatency.toFixed(1);
    el('rendered').textContent = metrics.rendered;
  }

  async function loop() {
    while (state.streaming) {
      const started = performance.now();
      try {
        const bitmap = await fetchFrame();
        if (bitmap) {
          ctx.drawImage(bitmap, 0, 0, canvas.width, canvas.height);
          bitmap.close();
          metrics.rendered++;
          record(performance.now() - started);
          el('status').textContent = 'Streaming';
        }
        await nextPaint();
      } catch (err) {
        el('status').textContent = 'Connecting...';
        await sleep(BACKOFF_MS);
      }
    }
  }

  function start() {
    if (state.streaming) return;
    state.streaming = true;
    state.windowFrames = 0;
    state.windowStart = performance.now();
    el('start').disabled = true;
    el('stop').disabled = false;
    el('status').textContent = 'Connecting...';
    loop();
  }

  function stop() {
    state.streaming = false;
    el('start').disabled = false;
    el('stop').disabled = true;
    el('status').textContent = 'Stopped';
  }

  el('start').addEventListener('click', start);
  el('stop').addEventListener('click', stop);
  document.querySelectorAll('[data-filter]').forEach((button) => {
    button.addEventListener('click', () => {
      fetch('/api/control?filter=' + encodeURIComponent(button.dataset.filter), { method: 'POST' })
        .catch(() => {});
    });
  });
  window.addEventListener('load', start);
})();
</script>
</body>
</html>
"##;
