use std::fmt::Write as _;

use crate::{
    config::{ConnectionFields, LoggerConfig},
    mode::LoggerMode,
    types::RoomRow,
};

const PAGE_STYLE: &str = r#"
    body{font-family:Arial,sans-serif;max-width:760px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password],input[type=number],select{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
    table{width:100%;border-collapse:collapse}td,th{padding:.3rem;text-align:left;border-bottom:1px solid #eee}
    nav a{margin-right:1rem}
"#;

const STATUS_SCRIPT: &str = r#"
    const q=(id)=>document.getElementById(id);
    function show(text,cls){q('status').className=cls;q('status').textContent=text;}
    async function post(path,payload){
      const opt={method:'POST'};
      if(payload!==undefined){opt.headers={'content-type':'application/json'};opt.body=JSON.stringify(payload);}
      const r=await fetch(path,opt);const t=await r.text();
      if(!r.ok)throw new Error(t||('Request failed: '+r.status));
      return t;
    }
"#;

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

const NAV: &str = r#"  <nav><a href="/config">Configuration</a><a href="/rooms">Rooms</a></nav>"#;

fn page(title: &str, nav: &str, body: &str, script: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{title}</title>
  <style>{PAGE_STYLE}</style>
</head>
<body>
{nav}
{body}
  <p id="status" class="muted"></p>
  <script>{STATUS_SCRIPT}{script}</script>
</body>
</html>
"#
    )
}

fn text_input(id: &str, label: &str, value: &str) -> String {
    format!(
        r#"<label>{label}</label><input id="{id}" type="text" value="{}">"#,
        escape_html(value)
    )
}

pub fn render_config_page(config: &LoggerConfig) -> String {
    let token_hint = if config.token.is_empty() {
        "not set"
    } else {
        "set; leave blank to keep"
    };
    let selected = |mode: LoggerMode| if config.mode == mode { " selected" } else { "" };
    let capability = if config.is_upload_capable() {
        r#"<span class="ok">ready to upload</span>"#
    } else {
        r#"<span class="err">org and token required for uploads</span>"#
    };

    let body = format!(
        r#"  <h1>Temperature Logger</h1>
  <p class="muted">Device <code>{device}</code> &middot; mode <b>{mode}</b> &middot; {capability}</p>

  <div class="card">
    <h2>Database</h2>
    {url}
    <label>Token ({token_hint})</label><input id="token" type="password">
    <div class="row">
      <div>{org}</div>
      <div>{bucket}</div>
    </div>
    {measurement}
    <button id="test">Test Connection</button>
  </div>

  <div class="card">
    <h2>Device</h2>
    {alias}
    <div class="row">
      <div><label>Resolution (bits)</label><input id="tempResBits" type="number" min="9" max="12" value="{bits}"></div>
      <div><label>Mode</label><select id="mode"><option value="operate"{operate}>Operate</option><option value="identify"{identify}>Identify</option></select></div>
    </div>
    <div class="row">
      <div><label>Upload interval (ms)</label><input id="operateIntervalMs" type="number" min="5000" max="3600000" value="{operate_ms}"></div>
      <div><label>Identify refresh (ms)</label><input id="identifyIntervalMs" type="number" min="2000" max="3600000" value="{identify_ms}"></div>
    </div>
    <button id="save">Save Configuration</button>
  </div>

  <div class="card">
    <h2>Maintenance</h2>
    <button id="reboot">Reboot</button>
    <button id="wifiReset">Reset WiFi</button>
  </div>
"#,
        device = escape_html(&config.device_id),
        mode = config.mode.as_str(),
        url = text_input("url", "Database URL", &config.url),
        org = text_input("org", "Organization", &config.org),
        bucket = text_input("bucket", "Bucket", &config.bucket),
        measurement = text_input("measurement", "Measurement", &config.measurement),
        alias = text_input("alias", "Alias (optional)", &config.alias),
        bits = config.temp_resolution_bits,
        operate = selected(LoggerMode::Operate),
        identify = selected(LoggerMode::Identify),
        operate_ms = config.operate_interval_ms,
        identify_ms = config.identify_interval_ms,
    );

    let script = r#"
    q('save').addEventListener('click', async ()=>{
      show('Saving...','muted');
      try{
        const payload={
          url:q('url').value.trim(),org:q('org').value.trim(),bucket:q('bucket').value.trim(),
          measurement:q('measurement').value.trim(),alias:q('alias').value.trim(),
          tempResBits:Number(q('tempResBits').value),operateIntervalMs:Number(q('operateIntervalMs').value),
          identifyIntervalMs:Number(q('identifyIntervalMs').value),mode:q('mode').value,
        };
        if(q('token').value)payload.token=q('token').value;
        show(await post('/save',payload),'ok');q('token').value='';
      }catch(err){show(err.message,'err');}
    });
    q('test').addEventListener('click', async ()=>{
      show('Testing...','muted');
      try{show(await post('/test'),'ok');}catch(err){show(err.message,'err');}
    });
    q('reboot').addEventListener('click', async ()=>{
      try{show(await post('/reboot'),'ok');}catch(err){show(err.message,'err');}
    });
    q('wifiReset').addEventListener('click', async ()=>{
      if(!confirm('Forget WiFi credentials and restart?'))return;
      try{show(await post('/wifiReset'),'ok');}catch(err){show(err.message,'err');}
    });
"#;

    page("Temperature Logger", NAV, &body, script)
}

pub fn render_rooms_page(rows: &[RoomRow], config: &LoggerConfig) -> String {
    let identify = config.mode == LoggerMode::Identify;

    let mut table = String::new();
    for row in rows {
        let _ = write!(
            table,
            r#"      <tr><td>{sensor}</td><td><code>{rom}</code></td><td><input class="room" data-idx="{idx}" type="text" value="{room}"></td><td id="t{idx}">--</td></tr>
"#,
            sensor = row.sensor,
            rom = row.rom.as_deref().unwrap_or("--"),
            idx = row.index,
            room = escape_html(&row.room),
        );
    }

    let hint = if identify {
        "Identify mode: warm a probe by hand and watch which row changes."
    } else {
        "Switch to identify mode on the configuration page to see live readings."
    };

    let body = format!(
        r#"  <h1>Rooms</h1>
  <p class="muted">{hint}</p>
  <div class="card">
    <table>
      <tr><th>Sensor</th><th>ROM</th><th>Room</th><th>&deg;C</th></tr>
{table}    </table>
    <button id="saveRooms">Save Rooms</button>
  </div>
"#
    );

    let mut script = String::from(
        r#"
    q('saveRooms').addEventListener('click', async ()=>{
      show('Saving...','muted');
      const rooms=[];
      document.querySelectorAll('input.room').forEach((el)=>{rooms[Number(el.dataset.idx)]=el.value.trim();});
      for(let i=0;i<rooms.length;i++){if(rooms[i]===undefined)rooms[i]='';}
      try{show(await post('/saveRooms',{rooms}),'ok');}catch(err){show(err.message,'err');}
    });
"#,
    );

    if identify {
        let _ = write!(
            script,
            r#"
    async function poll(){{
      try{{
        const r=await fetch('/api/temps');const d=await r.json();
        (d.sensors||[]).forEach((s)=>{{const c=q('t'+s.idx);if(c)c.textContent=s.ok?s.tC.toFixed(2):s.err;}});
      }}catch(_){{}}
    }}
    poll();setInterval(poll,{});
"#,
            config.identify_interval_ms
        );
    }

    page("Rooms", NAV, &body, &script)
}

pub fn render_portal_page(device_id: &str, seed: &ConnectionFields) -> String {
    let token_hint = if seed.token.is_empty() {
        "required for uploads"
    } else {
        "set; leave blank to keep"
    };
    let body = format!(
        r#"  <h1>Temperature Logger Setup</h1>
  <p class="muted">Device <code>{device}</code>. Join a network and point the logger at its database.</p>

  <div class="card">
    <h2>WiFi</h2>
    {ssid}
    <label>WiFi Password</label><input id="wifiPass" type="password">
  </div>

  <div class="card">
    <h2>Database</h2>
    {url}
    <label>Token ({token_hint})</label><input id="token" type="password">
    <div class="row">
      <div>{org}</div>
      <div>{bucket}</div>
    </div>
    {measurement}
    <button id="connect">Save and Connect</button>
  </div>
"#,
        device = escape_html(device_id),
        ssid = text_input("wifiSsid", "WiFi SSID", ""),
        url = text_input("url", "Database URL", &seed.url),
        org = text_input("org", "Organization", &seed.org),
        bucket = text_input("bucket", "Bucket", &seed.bucket),
        measurement = text_input("measurement", "Measurement", &seed.measurement),
    );

    let script = r#"
    q('connect').addEventListener('click', async ()=>{
      show('Connecting...','muted');
      try{
        const payload={
          wifiSsid:q('wifiSsid').value.trim(),wifiPass:q('wifiPass').value,
          url:q('url').value.trim(),token:q('token').value,org:q('org').value.trim(),
          bucket:q('bucket').value.trim(),measurement:q('measurement').value.trim(),
        };
        show(await post('/portal',payload),'ok');
      }catch(err){show(err.message,'err');}
    });
"#;

    page("Temperature Logger Setup", "", &body, script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<RoomRow> {
        vec![RoomRow {
            index: 0,
            sensor: "S1".to_string(),
            rom: Some("28FF000000000001".to_string()),
            room: "Kid's <room>".to_string(),
        }]
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn rooms_page_polls_only_in_identify() {
        let operate = LoggerConfig::default();
        let identify = LoggerConfig {
            mode: LoggerMode::Identify,
            identify_interval_ms: 2_500,
            ..LoggerConfig::default()
        };

        let operate_page = render_rooms_page(&rows(), &operate);
        let identify_page = render_rooms_page(&rows(), &identify);

        assert!(!operate_page.contains("/api/temps"));
        assert!(identify_page.contains("/api/temps"));
        assert!(identify_page.contains("setInterval(poll,2500)"));
        assert!(identify_page.contains("Kid&#39;s &lt;room&gt;"));
    }

    #[test]
    fn portal_page_prefills_seed_but_not_token() {
        let seed = ConnectionFields {
            url: "http://db:8086".to_string(),
            token: "hidden".to_string(),
            org: "home".to_string(),
            ..ConnectionFields::default()
        };

        let html = render_portal_page("esp32-ABCDEF", &seed);

        assert!(html.contains(r#"value="http://db:8086""#));
        assert!(html.contains(r#"value="home""#));
        assert!(!html.contains("hidden"));
        assert!(html.contains("esp32-ABCDEF"));
    }

    #[test]
    fn config_page_never_contains_token() {
        let config = LoggerConfig {
            token: "super-secret".to_string(),
            alias: "\"attic\"".to_string(),
            ..LoggerConfig::default()
        };

        let html = render_config_page(&config);

        assert!(!html.contains("super-secret"));
        assert!(html.contains("set; leave blank to keep"));
        assert!(html.contains("&quot;attic&quot;"));
        assert!(html.contains(r#"<option value="operate" selected>"#));
    }
}
